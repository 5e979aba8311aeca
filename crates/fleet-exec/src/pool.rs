use fleet_types::{AuthMode, ExecError};
use russh::client;
use russh::Disconnect;
use russh_keys::key::KeyPair;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct AcceptAnyHostKey;

// Trust-on-first-use convenience for lab fleets, not a security
// guarantee: any host identity is accepted.
#[async_trait::async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One pooled authenticated session plus the fingerprint it is stored
/// under. Shared by every concurrent execution targeting the same
/// (user, address, credential) triple.
#[derive(Clone)]
pub struct PooledConnection {
    pub(crate) handle: Arc<client::Handle<AcceptAnyHostKey>>,
    pub(crate) fingerprint: String,
}

enum Credential {
    Key(Arc<KeyPair>),
    Password(String),
}

/// Reuses healthy authenticated connections, discards and rebuilds
/// dead ones. Entries are keyed by a digest of the credential triple;
/// the secret itself is never stored.
pub struct ConnectionPool {
    connect_timeout: Duration,
    clients: Mutex<HashMap<String, Arc<client::Handle<AcceptAnyHostKey>>>>,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(
        &self,
        user: &str,
        addr: &str,
        auth_mode: AuthMode,
        secret: &str,
    ) -> Result<PooledConnection, ExecError> {
        let fingerprint = fingerprint(user, addr, auth_mode, secret);
        let cached = {
            let clients = self.clients.lock().expect("pool lock");
            clients.get(&fingerprint).cloned()
        };
        if let Some(handle) = cached {
            // russh surfaces a dead transport through is_closed; the
            // executor additionally evicts on session-open failure.
            if !handle.is_closed() {
                return Ok(PooledConnection {
                    handle,
                    fingerprint,
                });
            }
            tracing::debug!(fingerprint = %fingerprint, "evicting dead pooled connection");
            self.clients
                .lock()
                .expect("pool lock")
                .remove(&fingerprint);
        }

        let credential = match auth_mode {
            AuthMode::Key => {
                let pair = russh_keys::decode_secret_key(secret, None)
                    .map_err(|err| ExecError::Credential(err.to_string()))?;
                Credential::Key(Arc::new(pair))
            }
            AuthMode::Password => Credential::Password(secret.to_string()),
        };

        let target = normalize_addr(addr);
        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, target.as_str(), AcceptAnyHostKey),
        )
        .await
        .map_err(|_| ExecError::Transport(format!("connect to {target} timed out")))?
        .map_err(|err| ExecError::Transport(err.to_string()))?;

        let authed = match credential {
            Credential::Key(pair) => handle.authenticate_publickey(user, pair).await,
            Credential::Password(password) => {
                handle.authenticate_password(user, &password).await
            }
        }
        .map_err(|err| ExecError::Transport(err.to_string()))?;
        if !authed {
            return Err(ExecError::Transport(format!(
                "authentication rejected for {user}@{target}"
            )));
        }

        let handle = Arc::new(handle);
        self.clients
            .lock()
            .expect("pool lock")
            .insert(fingerprint.clone(), Arc::clone(&handle));
        Ok(PooledConnection {
            handle,
            fingerprint,
        })
    }

    /// Force-closes one entry. This is the only reliable way to
    /// unblock a hung remote command; concurrent users of the same
    /// credential triple reconnect transparently on next acquire.
    pub async fn discard(&self, fingerprint: &str) {
        let removed = self
            .clients
            .lock()
            .expect("pool lock")
            .remove(fingerprint);
        if let Some(handle) = removed {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    /// Process-shutdown teardown: closes every pooled connection and
    /// clears the map.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut clients = self.clients.lock().expect("pool lock");
            clients.drain().collect()
        };
        for (_, handle) in drained {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    pub fn size(&self) -> usize {
        self.clients.lock().expect("pool lock").len()
    }
}

fn fingerprint(user: &str, addr: &str, auth_mode: AuthMode, secret: &str) -> String {
    let digest = md5::compute(format!(
        "{user}@{addr}|{}:{secret}",
        auth_mode.as_str()
    ));
    format!("{digest:x}")
}

fn normalize_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:22")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_distinguishes_credentials() {
        let key = fingerprint("root", "10.0.0.1", AuthMode::Key, "material-a");
        let other_secret = fingerprint("root", "10.0.0.1", AuthMode::Key, "material-b");
        let other_mode = fingerprint("root", "10.0.0.1", AuthMode::Password, "material-a");
        let other_user = fingerprint("admin", "10.0.0.1", AuthMode::Key, "material-a");
        assert_ne!(key, other_secret);
        assert_ne!(key, other_mode);
        assert_ne!(key, other_user);
    }

    #[test]
    fn fingerprint_never_contains_secret() {
        let key = fingerprint("root", "10.0.0.1", AuthMode::Password, "hunter2");
        assert!(!key.contains("hunter2"));
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn bare_host_gets_default_port() {
        assert_eq!(normalize_addr("10.0.0.1"), "10.0.0.1:22");
        assert_eq!(normalize_addr("10.0.0.1:2222"), "10.0.0.1:2222");
    }

    #[tokio::test]
    async fn discard_of_unknown_fingerprint_is_noop() {
        let pool = ConnectionPool::new(Duration::from_secs(1));
        pool.discard("no-such-entry").await;
        assert_eq!(pool.size(), 0);
    }
}
