//! Minimal HTML pages served by the HTTP ingress.

/// Shared data rendered into every page footer/body.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub ssh_port: String,
    pub outbound_ip: String,
    pub lifetime_minutes: u64,
}

fn shell(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body>\n{body}\n</body>\n\
         </html>\n"
    )
}

/// Landing page with instructions to request a session.
pub fn index(ctx: &PageContext) -> String {
    let body = format!(
        "<h1>CTF session manager</h1>\n\
         <p>Request your own Linux session at <a href=\"/session\">/session</a>.</p>\n\
         <p>Sessions live for {} minutes and are reachable over SSH on port {}.</p>",
        ctx.lifetime_minutes, ctx.ssh_port
    );
    shell("CTF session manager", &body)
}

/// Page delivered with freshly assigned credentials.
pub fn session(ctx: &PageContext, username: &str, password: &str) -> String {
    let body = format!(
        "<h1>Your session is ready</h1>\n\
         <p>Username: <code>{username}</code></p>\n\
         <p>Password: <code>{password}</code></p>\n\
         <p>Connect with:</p>\n\
         <pre>ssh -p {port} {username}@{ip}</pre>\n\
         <p>The session expires {lifetime} minutes after this page was served.</p>",
        port = ctx.ssh_port,
        ip = ctx.outbound_ip,
        lifetime = ctx.lifetime_minutes,
    );
    shell("Your session", &body)
}

/// 429 page shown while the client is inside the throttle window.
pub fn throttled(ctx: &PageContext) -> String {
    let body = format!(
        "<h1>Too many requests</h1>\n\
         <p>Not enough time has passed since your last request. \
         Please wait before requesting another session; you can request one \
         every few minutes, and each session lives for {} minutes.</p>",
        ctx.lifetime_minutes
    );
    shell("Too many requests", &body)
}
