use crate::config::ListenAddress;
use crate::policy::Policy;
use crate::session::{Response, Session, NO_QUEUE_ID};
use indymilter::{Callbacks, Config as IndyConfig, Context, Macros, SetErrorReply, Status};
use std::ffi::{CStr, CString};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

pub struct Milter {
    policy: Arc<Policy>,
}

impl Milter {
    pub fn new(policy: Policy) -> Self {
        Milter {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Sessions live in the connection context, one per transaction, so no
    /// callback needs to lock anything. Stages without a callback are skipped
    /// during negotiation.
    pub fn callbacks(&self) -> Callbacks<Session> {
        let policy = self.policy.clone();
        Callbacks::new()
            .on_mail(move |ctx, _args| Box::pin(handle_mail(policy.clone(), ctx)))
            .on_header(|ctx, name, value| Box::pin(handle_header(ctx, name, value)))
            .on_eoh(|ctx| Box::pin(handle_eoh(ctx)))
            .on_abort(|ctx| Box::pin(handle_abort(ctx)))
            .on_close(|ctx| Box::pin(handle_close(ctx)))
    }

    pub async fn run<F>(&self, address: &ListenAddress, shutdown: F) -> anyhow::Result<()>
    where
        F: Future + Send,
    {
        let config = IndyConfig::default();
        match address {
            ListenAddress::Unix(path) => {
                // Remove a socket left over by a previous run
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                log::info!("Milter listening at unix://{}", path.display());
                let result = indymilter::run(listener, self.callbacks(), config, shutdown).await;
                remove_socket(path);
                result?;
            }
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                log::info!("Milter listening at tcp://{}", listener.local_addr()?);
                indymilter::run(listener, self.callbacks(), config, shutdown).await?;
            }
        }
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove socket {}: {}", path.display(), e);
    }
}

/// Read access to the macros sent by the MTA.
trait MacroSource {
    fn lookup(&self, name: &CStr) -> Option<&CStr>;
}

impl MacroSource for Macros {
    fn lookup(&self, name: &CStr) -> Option<&CStr> {
        self.get(name)
    }
}

fn macro_value<'a>(macros: &'a impl MacroSource, names: &[&CStr]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| macros.lookup(name))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn queue_id(macros: &impl MacroSource) -> Option<String> {
    macro_value(macros, &[c"i"]).map(str::to_string)
}

fn is_authenticated(macros: &impl MacroSource) -> bool {
    macro_value(macros, &[c"{auth_authen}", c"auth_authen"]).is_some()
}

fn refresh_queue_id(session: &mut Session, macros: &impl MacroSource) {
    if session.queue_id() == NO_QUEUE_ID {
        if let Some(id) = queue_id(macros) {
            session.set_queue_id(id);
        }
    }
}

async fn handle_mail(policy: Arc<Policy>, ctx: &mut Context<Session>) -> Status {
    let mut session = Session::new(policy);
    refresh_queue_id(&mut session, &ctx.macros);

    let response = session.on_mail_from(is_authenticated(&ctx.macros));
    ctx.data = Some(session);
    into_status(ctx, response)
}

async fn handle_header(ctx: &mut Context<Session>, name: CString, value: CString) -> Status {
    let Some(session) = ctx.data.as_mut() else {
        return Status::Continue;
    };
    refresh_queue_id(session, &ctx.macros);

    let name = name.to_string_lossy();
    let value = value.to_string_lossy();
    let response = session.on_header(&name, &value);
    into_status(ctx, response)
}

async fn handle_eoh(ctx: &mut Context<Session>) -> Status {
    let Some(session) = ctx.data.as_mut() else {
        log::debug!("End of headers without transaction, accepting");
        return Status::Accept;
    };
    refresh_queue_id(session, &ctx.macros);

    let response = session.on_headers_end();
    into_status(ctx, response)
}

async fn handle_abort(ctx: &mut Context<Session>) -> Status {
    ctx.data = None;
    Status::Continue
}

async fn handle_close(ctx: &mut Context<Session>) -> Status {
    ctx.data = None;
    Status::Continue
}

fn into_status(ctx: &mut Context<Session>, response: Response) -> Status {
    let queue_id = ctx.data.as_ref().map_or(NO_QUEUE_ID, |s| s.queue_id());
    apply_response(&mut ctx.reply, queue_id, response)
}

/// Maps a session response to the milter status, setting the SMTP reply
/// text for rejections.
fn apply_response(reply: &mut impl SetErrorReply, queue_id: &str, response: Response) -> Status {
    match response {
        Response::Continue => Status::Continue,
        Response::Accept => Status::Accept,
        Response::Reject(rejection) => {
            if let Err(e) = reply.set_error_reply(rejection.code, None, [rejection.text.as_str()]) {
                log::error!("{}: failed to set reply \"{}\": {}", queue_id, rejection, e);
            }
            Status::Reject
        }
    }
}
