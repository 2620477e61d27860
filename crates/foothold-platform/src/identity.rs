//! Users and groups as the target's account database describes them.

use foothold_core::Uid;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub uid: Uid,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// Lookup key for `find_user` / `find_group`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdQuery {
    Name(String),
    Id(u32),
}

impl From<&str> for IdQuery {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<u32> for IdQuery {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl User {
    pub fn matches(&self, query: &IdQuery) -> bool {
        match query {
            IdQuery::Name(n) => &self.name == n,
            IdQuery::Id(id) => self.uid == *id,
        }
    }
}

impl Group {
    pub fn matches(&self, query: &IdQuery) -> bool {
        match query {
            IdQuery::Name(n) => &self.name == n,
            IdQuery::Id(id) => self.gid == *id,
        }
    }
}

/// Parse `/etc/passwd`. Malformed lines are skipped.
pub fn parse_passwd(content: &str) -> Vec<User> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            if f.len() < 7 {
                return None;
            }
            Some(User {
                name: f[0].to_string(),
                uid: f[2].parse().ok()?,
                gid: f[3].parse().ok()?,
                gecos: f[4].to_string(),
                home: f[5].to_string(),
                shell: f[6].to_string(),
            })
        })
        .collect()
}

/// Parse `/etc/group`. Malformed lines are skipped.
pub fn parse_group(content: &str) -> Vec<Group> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            if f.len() < 4 {
                return None;
            }
            Some(Group {
                name: f[0].to_string(),
                gid: f[2].parse().ok()?,
                members: f[3]
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
# comment
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
broken:line
alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh
";

    const GROUP: &str = "\
root:x:0:
sudo:x:27:alice,bob
alice:x:1000:
";

    #[test]
    fn passwd_parses_and_skips_garbage() {
        let users = parse_passwd(PASSWD);
        assert_eq!(users.len(), 3);
        assert_eq!(users[2].name, "alice");
        assert_eq!(users[2].uid, 1000);
        assert_eq!(users[2].shell, "/bin/zsh");
        assert!(users[0].matches(&IdQuery::Id(0)));
        assert!(users[2].matches(&"alice".into()));
    }

    #[test]
    fn group_members() {
        let groups = parse_group(GROUP);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].members, vec!["alice", "bob"]);
        assert!(groups[0].members.is_empty());
        assert!(groups[1].matches(&IdQuery::Id(27)));
    }
}
