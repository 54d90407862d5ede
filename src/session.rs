use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::{ListenerConfig, TrustLevel};
use crate::reply::SmtpError;
use crate::utils::extract_domain;

/// Protocol state of one SMTP connection.
///
/// Owned by the connection task; the mail transaction (sender, recipients)
/// is cleared by [`Session::reset`] while authentication survives it.
pub struct Session {
    pub remote_addr: SocketAddr,
    pub trust_level: TrustLevel,
    pub helo: Option<String>,
    pub authenticated: bool,
    pub username: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub tls_active: bool,
    max_message_bytes: usize,
    max_recipients: usize,
    backend: Backend,
    ended: bool,
}

impl Session {
    pub(crate) fn new(backend: Backend, remote_addr: SocketAddr, listener: &ListenerConfig) -> Self {
        Self {
            remote_addr,
            trust_level: listener.trust_level,
            helo: None,
            authenticated: false,
            username: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            tls_active: listener.trust_level.implicit_tls(),
            max_message_bytes: listener.max_message_bytes,
            max_recipients: listener.max_recipients,
            backend,
            ended: false,
        }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    pub fn in_transaction(&self) -> bool {
        self.mail_from.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SmtpError> {
        if self.authenticated {
            return Err(SmtpError::ALREADY_AUTHENTICATED);
        }
        if self.in_transaction() {
            return Err(SmtpError::AUTH_IN_TRANSACTION);
        }

        info!(
            username,
            remote_addr = %self.remote_addr,
            method = "PLAIN",
            "SMTP authentication attempt"
        );

        if extract_domain(username).is_none() {
            warn!(username, remote_addr = %self.remote_addr, "SMTP authentication failed - invalid username format");
            return Err(SmtpError::AUTH_FAILED);
        }

        let account = match self.backend.authenticator().authenticate(username, password) {
            Ok(account) => account,
            Err(err) => {
                warn!(
                    username,
                    remote_addr = %self.remote_addr,
                    error = %err,
                    "SMTP authentication failed"
                );
                return Err(SmtpError::AUTH_FAILED);
            }
        };

        if !account.status.is_active() {
            warn!(
                username,
                remote_addr = %self.remote_addr,
                status = %account.status,
                "SMTP authentication failed - account not active"
            );
            return Err(SmtpError::AUTH_FAILED);
        }

        self.authenticated = true;
        self.username = Some(username.to_string());

        info!(username, remote_addr = %self.remote_addr, "SMTP authentication successful");
        Ok(())
    }

    pub fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        if self.trust_level.requires_auth() && !self.authenticated {
            debug!(
                from,
                remote_addr = %self.remote_addr,
                port = %self.trust_level,
                "MAIL FROM rejected, authentication required"
            );
            return Err(SmtpError::AUTH_REQUIRED);
        }
        if self.in_transaction() {
            return Err(SmtpError::NESTED_MAIL);
        }

        self.mail_from = Some(from.to_string());
        debug!(
            from,
            remote_addr = %self.remote_addr,
            username = self.username.as_deref().unwrap_or(""),
            "MAIL FROM"
        );
        Ok(())
    }

    pub fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        // Recipient existence, quota and greylisting are left to the queue.
        let Some(from) = self.mail_from.as_deref() else {
            return Err(SmtpError::MISSING_MAIL);
        };
        if self.rcpt_to.len() >= self.max_recipients {
            warn!(
                from,
                remote_addr = %self.remote_addr,
                limit = self.max_recipients,
                "recipient limit reached"
            );
            return Err(SmtpError::TOO_MANY_RECIPIENTS);
        }

        debug!(to, from, remote_addr = %self.remote_addr, "RCPT TO");
        self.rcpt_to.push(to.to_string());
        Ok(())
    }

    /// Whether a DATA command would be accepted right now.
    pub fn check_data_ready(&self) -> Result<(), SmtpError> {
        if self.mail_from.is_none() {
            Err(SmtpError::MISSING_MAIL)
        } else if self.rcpt_to.is_empty() {
            Err(SmtpError::MISSING_RCPT)
        } else {
            Ok(())
        }
    }

    /// Reads the message body and hands it to the queue, returning the
    /// queue's message id. Once the envelope is complete the message is
    /// terminal: queued or rejected, the transaction ends here.
    pub async fn data<R: AsyncRead + Unpin>(&mut self, reader: R) -> Result<String, SmtpError> {
        self.check_data_ready()?;
        let outcome = self.deliver(reader).await;
        self.reset();
        outcome
    }

    async fn deliver<R: AsyncRead + Unpin>(&self, reader: R) -> Result<String, SmtpError> {
        let from = self.mail_from.as_deref().unwrap_or_default();

        info!(
            from,
            to = ?self.rcpt_to,
            remote_addr = %self.remote_addr,
            "receiving message"
        );

        // One byte past the limit tells an exact fit from an oversize body.
        let limit = self.max_message_bytes as u64;
        let mut body = Vec::new();
        if let Err(err) = reader.take(limit + 1).read_to_end(&mut body).await {
            error!(
                error = %err,
                from,
                to = ?self.rcpt_to,
                remote_addr = %self.remote_addr,
                "failed to read message data"
            );
            return Err(SmtpError::READ_FAILED);
        }
        if body.len() as u64 > limit {
            warn!(
                from,
                to = ?self.rcpt_to,
                remote_addr = %self.remote_addr,
                limit,
                "message exceeds size limit"
            );
            return Err(SmtpError::MESSAGE_TOO_LARGE);
        }

        match self.backend.enqueuer().enqueue(from, &self.rcpt_to, &body) {
            Ok(message_id) => {
                info!(
                    message_id = %message_id,
                    from,
                    to = ?self.rcpt_to,
                    size = body.len(),
                    "message accepted"
                );
                Ok(message_id)
            }
            Err(err) => {
                error!(
                    error = %err,
                    from,
                    to = ?self.rcpt_to,
                    remote_addr = %self.remote_addr,
                    "failed to queue message"
                );
                Err(SmtpError::QUEUE_FAILED)
            }
        }
    }

    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    /// Forgets everything learned from the client, as required after a
    /// STARTTLS upgrade.
    pub fn reset_all(&mut self) {
        self.helo = None;
        self.authenticated = false;
        self.username = None;
        self.reset();
    }

    pub fn logout(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        debug!(
            username = self.username.as_deref().unwrap_or(""),
            remote_addr = %self.remote_addr,
            "SMTP session ended"
        );
    }
}
