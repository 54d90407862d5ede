use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::ListenerConfig;
use crate::dot::DotReader;
use crate::reply::SmtpError;
use crate::session::Session;
use crate::utils::escape_for_log;

const MAX_LINE: u64 = 4096;

const NEED_HELO: &str = "503 5.5.1 Please introduce yourself first\r\n";

/// Everything a connection task needs from its listener.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub listener: Arc<ListenerConfig>,
    pub backend: Backend,
    pub tls: Option<TlsAcceptor>,
    pub shutdown: watch::Receiver<bool>,
}

enum Flow<S> {
    Closed,
    StartTls(S),
}

enum Next {
    Continue,
    Quit,
    StartTls,
}

/// Resolves once shutdown has been requested, or the listener set is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) async fn handle(mut ctx: ConnectionContext, mut stream: TcpStream, remote_addr: SocketAddr) {
    if !ctx.backend.admit(remote_addr.ip()) {
        warn!("connection rate limit exceeded");
        let _ = timeout(
            ctx.listener.write_timeout,
            stream.write_all(b"421 4.7.0 Too many connections from your IP\r\n"),
        )
        .await;
        return;
    }

    info!(trust_level = %ctx.listener.trust_level, "new connection");

    let result = if ctx.listener.trust_level.implicit_tls() {
        serve_implicit_tls(&mut ctx, stream, remote_addr).await
    } else {
        serve_plain(&mut ctx, stream, remote_addr).await
    };

    match result {
        Ok(()) => info!("connection closed"),
        Err(err) => info!(error = %err, "connection closed with error"),
    }
}

async fn serve_implicit_tls(ctx: &mut ConnectionContext, stream: TcpStream, remote_addr: SocketAddr) -> io::Result<()> {
    let Some(acceptor) = ctx.tls.clone() else {
        warn!("implicit TLS listener without TLS configuration");
        return Ok(());
    };

    let stream = match timeout(ctx.listener.read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(error = %err, "TLS handshake failed");
            return Ok(());
        }
        Err(_) => {
            warn!("TLS handshake timed out");
            return Ok(());
        }
    };
    debug!("TLS session established");

    let mut session = ctx.backend.new_session(remote_addr, &ctx.listener);
    let result = converse(ctx, BufReader::new(stream), &mut session, true).await;
    session.logout();
    result.map(|_| ())
}

async fn serve_plain(ctx: &mut ConnectionContext, stream: TcpStream, remote_addr: SocketAddr) -> io::Result<()> {
    let mut session = ctx.backend.new_session(remote_addr, &ctx.listener);

    let result = match converse(ctx, BufReader::new(stream), &mut session, true).await {
        Ok(Flow::StartTls(stream)) => upgrade(ctx, stream, &mut session).await,
        Ok(Flow::Closed) => Ok(()),
        Err(err) => Err(err),
    };

    session.logout();
    result
}

async fn upgrade(ctx: &mut ConnectionContext, stream: TcpStream, session: &mut Session) -> io::Result<()> {
    let Some(acceptor) = ctx.tls.clone() else {
        return Ok(());
    };

    let stream = match timeout(ctx.listener.read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(error = %err, "STARTTLS handshake failed");
            return Ok(());
        }
        Err(_) => {
            warn!("STARTTLS handshake timed out");
            return Ok(());
        }
    };
    debug!("STARTTLS session established");

    session.reset_all();
    session.tls_active = true;
    converse(ctx, BufReader::new(stream), session, false).await.map(|_| ())
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut BufReader<S>, line: &mut Vec<u8>) -> io::Result<usize> {
    (&mut *stream).take(MAX_LINE).read_until(b'\n', line).await
}

async fn write_reply<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    write_timeout: Duration,
    reply: &str,
) -> io::Result<()> {
    debug!("<< {}", reply.trim_end());
    let write = async {
        let stream = stream.get_mut();
        stream.write_all(reply.as_bytes()).await?;
        stream.flush().await
    };
    match timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Runs the command loop until the client quits, the connection fails, or
/// a STARTTLS upgrade hands the raw stream back.
async fn converse<S>(
    ctx: &mut ConnectionContext,
    mut stream: BufReader<S>,
    session: &mut Session,
    greet: bool,
) -> io::Result<Flow<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let listener = ctx.listener.clone();
    if greet {
        let banner = format!("220 {} ESMTP ready\r\n", listener.hostname);
        write_reply(&mut stream, listener.write_timeout, &banner).await?;
    }

    let mut line = Vec::new();
    loop {
        line.clear();

        let read = tokio::select! {
            biased;
            _ = shutdown_requested(&mut ctx.shutdown) => {
                write_reply(&mut stream, listener.write_timeout, "421 4.3.0 Service shutting down\r\n").await?;
                return Ok(Flow::Closed);
            }
            read = timeout(listener.read_timeout, read_line(&mut stream, &mut line)) => read,
        };

        match read {
            Err(_) => {
                write_reply(
                    &mut stream,
                    listener.write_timeout,
                    "421 4.4.2 Idle timeout, closing connection\r\n",
                )
                .await?;
                return Ok(Flow::Closed);
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(0)) => return Ok(Flow::Closed),
            Ok(Ok(_)) if !line.ends_with(b"\n") => {
                if line.len() as u64 >= MAX_LINE {
                    write_reply(&mut stream, listener.write_timeout, "500 5.5.2 Line too long\r\n").await?;
                }
                return Ok(Flow::Closed);
            }
            Ok(Ok(_)) => {}
        }

        match command(ctx, &mut stream, session, &line).await? {
            Next::Continue => {}
            Next::Quit => return Ok(Flow::Closed),
            Next::StartTls => return Ok(Flow::StartTls(stream.into_inner())),
        }
    }
}

async fn command<S>(
    ctx: &ConnectionContext,
    stream: &mut BufReader<S>,
    session: &mut Session,
    line: &[u8],
) -> io::Result<Next>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(['\r', '\n']);
    let (verb, args) = match text.split_once(' ') {
        Some((verb, args)) => (verb, args.trim()),
        None => (text, ""),
    };
    let verb = verb.to_ascii_uppercase();

    if verb == "AUTH" {
        // Initial responses carry credentials.
        debug!(">> AUTH {}", args.split_whitespace().next().unwrap_or(""));
    } else {
        debug!(">> {}", escape_for_log(line));
    }

    let write_timeout = ctx.listener.write_timeout;
    let reply = match verb.as_str() {
        "EHLO" => hello(ctx, session, args, true),
        "HELO" => hello(ctx, session, args, false),
        "STARTTLS" => {
            if starttls_available(ctx, session) {
                write_reply(stream, write_timeout, "220 2.0.0 Ready to start TLS\r\n").await?;
                return Ok(Next::StartTls);
            }
            "454 4.7.0 TLS not available\r\n".to_string()
        }
        "AUTH" => match auth(ctx, stream, session, args).await? {
            Some(reply) => reply,
            None => return Ok(Next::Quit),
        },
        "MAIL" => mail(session, args),
        "RCPT" => rcpt(session, args),
        "DATA" => return data(ctx, stream, session).await,
        "RSET" => {
            session.reset();
            "250 2.0.0 OK\r\n".to_string()
        }
        "NOOP" => "250 2.0.0 OK\r\n".to_string(),
        "VRFY" | "EXPN" => "252 2.5.0 Cannot VRFY user\r\n".to_string(),
        "QUIT" => {
            write_reply(stream, write_timeout, "221 2.0.0 Bye\r\n").await?;
            return Ok(Next::Quit);
        }
        _ => "500 5.5.2 Command not recognized\r\n".to_string(),
    };

    write_reply(stream, write_timeout, &reply).await?;
    Ok(Next::Continue)
}

fn starttls_available(ctx: &ConnectionContext, session: &Session) -> bool {
    ctx.tls.is_some() && ctx.listener.trust_level.offers_starttls() && !session.tls_active
}

fn auth_available(ctx: &ConnectionContext, session: &Session) -> bool {
    !session.authenticated && (session.tls_active || ctx.listener.trust_level.allows_plaintext_auth())
}

fn hello(ctx: &ConnectionContext, session: &mut Session, args: &str, extended: bool) -> String {
    let Some(domain) = args.split_whitespace().next() else {
        return "501 5.5.4 Domain/address argument required\r\n".to_string();
    };

    session.reset();
    session.helo = Some(domain.to_string());

    let greeting = format!("{} Hello {}", ctx.listener.hostname, domain);
    if !extended {
        return format!("250 {}\r\n", greeting);
    }

    let mut lines = vec![
        greeting,
        "PIPELINING".to_string(),
        "8BITMIME".to_string(),
        "ENHANCEDSTATUSCODES".to_string(),
        format!("SIZE {}", session.max_message_bytes()),
    ];
    if starttls_available(ctx, session) {
        lines.push("STARTTLS".to_string());
    }
    if auth_available(ctx, session) {
        lines.push("AUTH PLAIN".to_string());
    }

    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("250{}{}\r\n", if i == last { ' ' } else { '-' }, line))
        .collect()
}

/// Returns `None` when the client vanished during the exchange.
async fn auth<S>(
    ctx: &ConnectionContext,
    stream: &mut BufReader<S>,
    session: &mut Session,
    args: &str,
) -> io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if session.helo.is_none() {
        return Ok(Some(NEED_HELO.to_string()));
    }
    if !session.tls_active && !ctx.listener.trust_level.allows_plaintext_auth() {
        return Ok(Some("523 5.7.10 TLS is required\r\n".to_string()));
    }

    let mut parts = args.split_whitespace();
    let mechanism = parts.next().unwrap_or("");
    if !mechanism.eq_ignore_ascii_case("PLAIN") {
        return Ok(Some("504 5.7.4 Unsupported authentication mechanism\r\n".to_string()));
    }
    if session.authenticated {
        return Ok(Some(SmtpError::ALREADY_AUTHENTICATED.to_wire()));
    }

    let response = match parts.next() {
        Some(initial) => initial.to_string(),
        None => {
            write_reply(stream, ctx.listener.write_timeout, "334 \r\n").await?;
            let mut line = Vec::new();
            match timeout(ctx.listener.read_timeout, read_line(stream, &mut line)).await {
                Ok(Ok(0)) | Err(_) => return Ok(None),
                Ok(Ok(_)) => String::from_utf8_lossy(&line).trim().to_string(),
                Ok(Err(err)) => return Err(err),
            }
        }
    };

    if response == "*" {
        return Ok(Some("501 5.0.0 Authentication cancelled\r\n".to_string()));
    }
    let decoded = if response == "=" {
        Vec::new()
    } else {
        match STANDARD.decode(response.as_bytes()) {
            Ok(decoded) => decoded,
            Err(_) => return Ok(Some("501 5.5.2 Invalid base64 data\r\n".to_string())),
        }
    };
    let Some((username, password)) = parse_plain(&decoded) else {
        return Ok(Some("501 5.5.2 Invalid PLAIN response\r\n".to_string()));
    };

    Ok(Some(match session.auth_plain(&username, &password) {
        Ok(()) => "235 2.7.0 Authentication succeeded\r\n".to_string(),
        Err(err) => err.to_wire(),
    }))
}

/// Splits a SASL PLAIN message (`authzid NUL authcid NUL passwd`). The
/// authorization identity stands in when the authentication identity is
/// empty.
fn parse_plain(message: &[u8]) -> Option<(String, String)> {
    let mut fields = message.split(|byte| *byte == 0);
    let authzid = fields.next()?;
    let authcid = fields.next()?;
    let passwd = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let username = if authcid.is_empty() { authzid } else { authcid };
    if username.is_empty() {
        return None;
    }
    Some((
        String::from_utf8(username.to_vec()).ok()?,
        String::from_utf8(passwd.to_vec()).ok()?,
    ))
}

/// Extracts the path of `MAIL FROM:<path>` or `RCPT TO:<path>`, ignoring
/// any ESMTP parameters after it.
fn parse_path(args: &str, prefix: &str) -> Option<String> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = args[prefix.len()..].trim_start();

    if let Some(quoted) = rest.strip_prefix('<') {
        let end = quoted.find('>')?;
        Some(quoted[..end].to_string())
    } else {
        rest.split_whitespace().next().map(str::to_string)
    }
}

fn mail(session: &mut Session, args: &str) -> String {
    if session.helo.is_none() {
        return NEED_HELO.to_string();
    }
    let Some(from) = parse_path(args, "FROM:") else {
        return "501 5.5.4 Syntax: MAIL FROM:<address>\r\n".to_string();
    };
    match session.mail(&from) {
        Ok(()) => "250 2.1.0 Sender OK\r\n".to_string(),
        Err(err) => err.to_wire(),
    }
}

fn rcpt(session: &mut Session, args: &str) -> String {
    if session.helo.is_none() {
        return NEED_HELO.to_string();
    }
    let Some(to) = parse_path(args, "TO:").filter(|to| !to.is_empty()) else {
        return "501 5.5.4 Syntax: RCPT TO:<address>\r\n".to_string();
    };
    match session.rcpt(&to) {
        Ok(()) => "250 2.1.5 Recipient OK\r\n".to_string(),
        Err(err) => err.to_wire(),
    }
}

async fn data<S>(ctx: &ConnectionContext, stream: &mut BufReader<S>, session: &mut Session) -> io::Result<Next>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let write_timeout = ctx.listener.write_timeout;
    if let Err(err) = session.check_data_ready() {
        write_reply(stream, write_timeout, &err.to_wire()).await?;
        return Ok(Next::Continue);
    }
    write_reply(stream, write_timeout, "354 Start mail input; end with <CRLF>.<CRLF>\r\n").await?;

    let (outcome, framing_lost) = {
        let mut body = DotReader::new(&mut *stream, ctx.listener.read_timeout);
        let outcome = session.data(&mut body).await;

        // Whatever the session left unread still belongs to this message.
        let mut lost = body.failed();
        if !lost && !body.is_done() {
            lost = tokio::io::copy(&mut body, &mut tokio::io::sink()).await.is_err();
        }
        (outcome, lost)
    };
    session.reset();

    let reply = match outcome {
        Ok(message_id) => format!("250 2.0.0 OK: queued as {}\r\n", message_id),
        Err(err) => err.to_wire(),
    };
    write_reply(stream, write_timeout, &reply).await?;

    Ok(if framing_lost { Next::Quit } else { Next::Continue })
}
