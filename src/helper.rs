//! Credential acquisition through login helper programs
//!
//! A helper is an external program speaking a fixed line protocol on
//! stdin/stdout. It is invoked with two arguments: a human-readable
//! banner and a usage tag (`API` or `Web`). The parent writes one URL
//! line for the API usage or two for the Web usage, reads back an `OK`
//! acknowledgement, then exchanges one line per credential key. A
//! trailing blank line signals completion, and the helper must exit
//! with status 0.
//!
//! Helpers found in the data directory are tried in name order; the
//! interactive builtin prompt is the fallback of last resort.

use crate::config::{Config, Endpoints};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Banner passed to every helper as its first argument
pub const HELPER_BANNER: &str = "lms-dl login helper";

/// Which credential set a helper run is acquiring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// The structured-API session cookies
    Api,
    /// The web-realm session cookies
    Web,
}

impl Usage {
    /// The literal token passed to helpers
    pub fn tag(self) -> &'static str {
        match self {
            Usage::Api => "API",
            Usage::Web => "Web",
        }
    }
}

/// One way of acquiring a credential set
pub trait CredentialHelper {
    /// Identity used to skip same-named helpers found twice
    fn name(&self) -> String;

    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Acquire the cookies for one usage context
    fn run(
        &mut self,
        usage: Usage,
        endpoints: &Endpoints,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>>;
}

/// An external helper program on disk
pub struct ExternalHelper {
    path: PathBuf,
}

impl ExternalHelper {
    /// Wrap the helper executable at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ExternalHelper { path: path.into() }
    }

    fn exchange(
        &self,
        child: &mut Child,
        usage: Usage,
        endpoints: &Endpoints,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let Some(mut stdin) = child.stdin.take() else {
            return Err(Error::Helper(format!("{} has no stdin", self.name())));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(Error::Helper(format!("{} has no stdout", self.name())));
        };
        let mut reader = BufReader::new(stdout);

        match usage {
            Usage::Api => {
                writeln!(stdin, "{}", endpoints.api_url)?;
            }
            Usage::Web => {
                writeln!(stdin, "{}", endpoints.session_check_url)?;
                writeln!(stdin, "{}", endpoints.web_url)?;
            }
        }
        stdin.flush()?;

        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim_end() != "OK" {
            return Err(Error::Helper(format!(
                "{} did not acknowledge the handshake",
                self.name()
            )));
        }

        let mut cookies = BTreeMap::new();
        for key in keys {
            writeln!(stdin, "{key}")?;
            stdin.flush()?;
            let mut value = String::new();
            if reader.read_line(&mut value)? == 0 {
                return Err(Error::Helper(format!(
                    "{} closed the stream before answering {key}",
                    self.name()
                )));
            }
            cookies.insert(
                key.clone(),
                value.trim_end_matches(['\r', '\n']).to_string(),
            );
        }

        // A blank line tells the helper the exchange is complete.
        writeln!(stdin)?;
        stdin.flush()?;
        drop(stdin);

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Helper(format!(
                "{} exited with {status}",
                self.name()
            )));
        }
        Ok(cookies)
    }
}

impl CredentialHelper for ExternalHelper {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn describe(&self) -> String {
        format!("<external> {}", self.path.display())
    }

    fn run(
        &mut self,
        usage: Usage,
        endpoints: &Endpoints,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let mut child = Command::new(&self.path)
            .arg(HELPER_BANNER)
            .arg(usage.tag())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Helper(format!("could not start {}: {e}", self.path.display()))
            })?;
        let result = self.exchange(&mut child, usage, endpoints, keys);
        if result.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        result
    }
}

/// Interactive fallback: print the sign-in URL and read the cookie
/// values from the terminal.
pub struct BuiltinHelper;

impl CredentialHelper for BuiltinHelper {
    fn name(&self) -> String {
        String::new()
    }

    fn describe(&self) -> String {
        "<builtin>".to_string()
    }

    fn run(
        &mut self,
        usage: Usage,
        endpoints: &Endpoints,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let url = match usage {
            Usage::Api => &endpoints.api_url,
            Usage::Web => &endpoints.session_check_url,
        };
        eprintln!("Sign in at {url} and paste the cookie values below.");
        let mut cookies = BTreeMap::new();
        let stdin = std::io::stdin();
        for key in keys {
            eprint!("{} {key}: ", usage.tag());
            std::io::stderr().flush()?;
            let mut value = String::new();
            if stdin.read_line(&mut value)? == 0 {
                return Err(Error::Helper("end of input while reading cookies".into()));
            }
            cookies.insert(key.clone(), value.trim().to_string());
        }
        Ok(cookies)
    }
}

/// Runs helpers in order until one completes both usage contexts, then
/// installs (and optionally stores) the acquired cookies.
pub struct Login<'a> {
    config: &'a mut Config,
    profile: String,
    store: bool,
}

impl<'a> Login<'a> {
    /// A login flow updating `config`; `store` controls whether the
    /// acquired cookies are written back to the profile file.
    pub fn new(config: &'a mut Config, profile: &str, store: bool) -> Self {
        Login {
            config,
            profile: profile.to_string(),
            store,
        }
    }

    /// Try every helper; returns whether one produced a full session.
    pub fn run(&mut self) -> Result<bool> {
        let mut helpers = discover_helpers();
        helpers.push(Box::new(BuiltinHelper));
        let keys = self.config.credential_keys.clone();

        let mut used = BTreeSet::new();
        for mut helper in helpers {
            if !used.insert(helper.name()) {
                tracing::info!(helper = %helper.describe(), "skipping same-named helper");
                continue;
            }
            tracing::info!(helper = %helper.describe(), "trying login helper");
            let api_cookies = match helper.run(Usage::Api, &self.config.endpoints, &keys) {
                Ok(cookies) => cookies,
                Err(e) => {
                    tracing::warn!(helper = %helper.describe(), error = %e, "helper failed");
                    continue;
                }
            };
            let web_cookies = match helper.run(Usage::Web, &self.config.endpoints, &keys) {
                Ok(cookies) => cookies,
                Err(e) => {
                    tracing::warn!(helper = %helper.describe(), error = %e, "helper failed");
                    continue;
                }
            };
            self.config.api_cookies = api_cookies;
            self.config.web_cookies = web_cookies;
            if self.store {
                self.config.store(&self.profile)?;
            }
            return Ok(true);
        }
        tracing::error!("no login helper produced a usable session");
        Ok(false)
    }
}

/// External helpers in the data directory, in name order
fn discover_helpers() -> Vec<Box<dyn CredentialHelper>> {
    let Some(dirs) = directories::ProjectDirs::from("", "", "lms-dl") else {
        return Vec::new();
    };
    let helpers_dir = dirs.data_dir().join("helpers");
    let Ok(entries) = std::fs::read_dir(&helpers_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    tracing::info!(dir = %helpers_dir.display(), count = paths.len(), "login helpers found");
    paths
        .into_iter()
        .map(|path| Box::new(ExternalHelper::new(path)) as Box<dyn CredentialHelper>)
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn endpoints() -> Endpoints {
        Endpoints {
            api_url: "https://lms.example.edu/app/login.php".into(),
            web_url: "https://lms.example.edu".into(),
            file_url: "https://lms.example.edu".into(),
            session_check_url: "https://lms.example.edu/check.php".into(),
            api_args: Default::default(),
        }
    }

    fn write_helper(dir: &std::path::Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const WELL_BEHAVED: &str = r#"#!/bin/sh
read url
if [ "$2" = "Web" ]; then read url2; fi
echo OK
while read key; do
  if [ -z "$key" ]; then exit 0; fi
  echo "cookie-$key"
done
exit 0
"#;

    #[test]
    fn external_helper_exchanges_keys_for_values() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_helper(temp.path(), "helper-test", WELL_BEHAVED);
        let keys = vec!["PHPSESSID".to_string(), "user".to_string()];

        let mut helper = ExternalHelper::new(&path);
        let api = helper.run(Usage::Api, &endpoints(), &keys).unwrap();
        assert_eq!(api.get("PHPSESSID").map(String::as_str), Some("cookie-PHPSESSID"));
        assert_eq!(api.get("user").map(String::as_str), Some("cookie-user"));

        // The Web usage reads two URL lines instead of one.
        let web = helper.run(Usage::Web, &endpoints(), &keys).unwrap();
        assert_eq!(web.len(), 2);
    }

    #[test]
    fn missing_acknowledgement_fails_the_exchange() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_helper(
            temp.path(),
            "helper-noack",
            "#!/bin/sh\nread url\necho NOPE\nexit 0\n",
        );
        let mut helper = ExternalHelper::new(&path);
        let err = helper
            .run(Usage::Api, &endpoints(), &["user".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Helper(_)));
    }

    #[test]
    fn nonzero_exit_status_fails_even_after_a_full_exchange() {
        let temp = tempfile::tempdir().unwrap();
        let script = r#"#!/bin/sh
read url
echo OK
while read key; do
  if [ -z "$key" ]; then exit 3; fi
  echo "cookie-$key"
done
exit 3
"#;
        let path = write_helper(temp.path(), "helper-badexit", script);
        let mut helper = ExternalHelper::new(&path);
        let err = helper
            .run(Usage::Api, &endpoints(), &["user".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Helper(_)));
    }

    #[test]
    fn early_eof_on_a_value_read_is_a_hard_failure() {
        let temp = tempfile::tempdir().unwrap();
        let path = write_helper(
            temp.path(),
            "helper-eof",
            "#!/bin/sh\nread url\necho OK\nexit 0\n",
        );
        let mut helper = ExternalHelper::new(&path);
        let err = helper
            .run(Usage::Api, &endpoints(), &["user".to_string()])
            .unwrap_err();
        // Depending on timing this surfaces as the EOF check or as a
        // broken pipe on the key write.
        assert!(matches!(err, Error::Helper(_) | Error::Io(_)));
    }
}
