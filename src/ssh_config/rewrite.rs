use super::model::SshConfigFile;

const IDENTITY_FILE: &str = "IdentityFile";
const USER: &str = "User";

/// The identity file and user to install for a host.
/// An empty field means "leave that directive unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialIntent {
    pub identity_file: String,
    pub username: String,
}

impl CredentialIntent {
    pub fn new(identity_file: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            identity_file: identity_file.into(),
            username: username.into(),
        }
    }

    /// Nothing to change.
    pub fn is_empty(&self) -> bool {
        self.identity_file.is_empty() && self.username.is_empty()
    }

    /// Both fields set.
    pub fn is_complete(&self) -> bool {
        !self.identity_file.is_empty() && !self.username.is_empty()
    }

    /// Reject values that would not read back as the same single directive value.
    pub fn check(&self) -> Result<(), String> {
        for (name, value) in [("identity file", &self.identity_file), ("user", &self.username)] {
            if value.contains(['\n', '\r']) {
                return Err(format!("{} {:?} spans more than one line", name, value));
            }
            if value.contains('"') {
                return Err(format!("{} {:?} contains a double quote", name, value));
            }
            if value.ends_with('\\') {
                return Err(format!("{} {:?} ends with a backslash", name, value));
            }
        }
        Ok(())
    }
}

/// What a rewrite touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub blocks_matched: usize,
    pub values_changed: usize,
}

impl SshConfigFile {
    /// Point every `IdentityFile` and `User` directive in the blocks matching `host` at `intent`.
    ///
    /// Directives are only ever updated in place. A matching block that has no
    /// `IdentityFile` or `User` line does not get one, and no block is created when
    /// nothing matches.
    pub fn apply_intent(&mut self, host: &str, intent: &CredentialIntent) -> RewriteSummary {
        let mut summary = RewriteSummary::default();

        for block in self.matching_blocks_mut(host) {
            summary.blocks_matched += 1;
            for (key, value) in [(IDENTITY_FILE, &intent.identity_file), (USER, &intent.username)] {
                if value.is_empty() {
                    continue;
                }
                if !block.has_key(key) {
                    log::warn!("Host {} has no {} line, leaving it as is", block.label(), key);
                    continue;
                }
                for kv in block.key_values_mut(key) {
                    if kv.set_value(value) {
                        summary.values_changed += 1;
                    }
                }
            }
        }

        if summary.blocks_matched == 0 {
            let known: Vec<String> = self.blocks().map(|b| b.label()).collect();
            log::warn!("No Host block matches {} (blocks: {})", host, known.join(", "));
        }
        summary
    }
}
