//! Account store backed by the configuration file.

use std::collections::HashMap;

use anyhow::bail;

use crate::backend::{Account, AccountStatus, Authenticator};
use crate::config::AccountConfig;

struct Entry {
    password: String,
    status: AccountStatus,
}

/// Looks accounts up in a fixed table. Usernames match case-insensitively,
/// passwords exactly.
pub struct StaticAuthenticator {
    accounts: HashMap<String, Entry>,
}

impl StaticAuthenticator {
    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let accounts = accounts
            .iter()
            .map(|account| {
                (
                    account.username.to_ascii_lowercase(),
                    Entry {
                        password: account.password.clone(),
                        status: account.status,
                    },
                )
            })
            .collect();
        Self { accounts }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

fn passwords_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len() && openssl::memcmp::eq(expected.as_bytes(), given.as_bytes())
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<Account> {
        let key = username.to_ascii_lowercase();
        match self.accounts.get(&key) {
            Some(entry) if passwords_match(&entry.password, password) => Ok(Account {
                username: key,
                status: entry.status,
            }),
            _ => bail!("invalid credentials"),
        }
    }
}
