//! Principals attached to an authenticated caller.

use std::fmt;

/// Identity published once the proxy login has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyPrincipal {
    name: String,
}

impl ProxyPrincipal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ProxyPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyPrincipal[{}]", self.name)
    }
}

/// A single identity claim about a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// OS user name.
    UnixUser(String),
    /// Numeric user id.
    UnixNumericUser(u32),
    /// Numeric group id; `primary` marks the user's primary group.
    UnixNumericGroup { gid: u32, primary: bool },
    /// Published by `ProxyLoginModule::commit`.
    Proxy(ProxyPrincipal),
}

/// Set of principals describing one caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    principals: Vec<Principal>,
}

impl Subject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn principals(&self) -> &[Principal] {
        &self.principals
    }

    /// Add a principal unless an identical one is already present.
    pub fn add(&mut self, principal: Principal) {
        if !self.principals.contains(&principal) {
            self.principals.push(principal);
        }
    }

    pub fn remove(&mut self, principal: &Principal) -> bool {
        let before = self.principals.len();
        self.principals.retain(|p| p != principal);
        before != self.principals.len()
    }

    pub fn username(&self) -> Option<&str> {
        self.principals.iter().find_map(|p| match p {
            Principal::UnixUser(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn uid(&self) -> Option<u32> {
        self.principals.iter().find_map(|p| match p {
            Principal::UnixNumericUser(uid) => Some(*uid),
            _ => None,
        })
    }

    /// Primary group id.
    pub fn primary_gid(&self) -> Option<u32> {
        self.principals.iter().find_map(|p| match p {
            Principal::UnixNumericGroup { gid, primary: true } => Some(*gid),
            _ => None,
        })
    }

    pub fn proxy_principals(&self) -> impl Iterator<Item = &ProxyPrincipal> {
        self.principals.iter().filter_map(|p| match p {
            Principal::Proxy(principal) => Some(principal),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let mut subject = Subject::new();
        subject.add(Principal::UnixUser("duke".into()));
        subject.add(Principal::UnixNumericUser(9000));
        subject.add(Principal::UnixNumericGroup {
            gid: 10,
            primary: false,
        });
        subject.add(Principal::UnixNumericGroup {
            gid: 9001,
            primary: true,
        });

        assert_eq!(subject.username(), Some("duke"));
        assert_eq!(subject.uid(), Some(9000));
        assert_eq!(subject.primary_gid(), Some(9001));
        assert_eq!(subject.proxy_principals().count(), 0);
    }

    #[test]
    fn test_add_is_deduplicated() {
        let mut subject = Subject::new();
        subject.add(Principal::UnixNumericUser(1));
        subject.add(Principal::UnixNumericUser(1));
        assert_eq!(subject.principals().len(), 1);
        assert!(subject.remove(&Principal::UnixNumericUser(1)));
        assert!(!subject.remove(&Principal::UnixNumericUser(1)));
    }
}
