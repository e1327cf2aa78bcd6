//! Child process spawning for services and exec probes.
//!
//! The command is split with POSIX shell-word rules and resolved against
//! PATH. Children get their own process group so signals reach the whole
//! service subtree, inherit the daemon environment overlaid with the
//! service-declared variables, and optionally drop to a resolved uid/gid.
//! Both output streams feed the service's ring buffer through a
//! timestamping writer.

use std::{
    collections::BTreeMap,
    env,
    io::{BufRead, BufReader, Read},
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread,
};

use nix::unistd::{Group, User};
use regex::Regex;
use tracing::{debug, warn};

use crate::{error::ServiceError, logs::OutputWriter, plan::parse_command};

/// Everything needed to materialize one service (or probe) process.
pub struct SpawnSpec<'a> {
    /// Service name, used for errors and log labels.
    pub name: &'a str,
    /// Full command string, possibly with a `[ default-args ]` segment.
    pub command: &'a str,
    /// Replacement for the bracketed default arguments, if any.
    pub extra_args: Option<&'a [String]>,
    /// Environment overlaid on the daemon environment; values may use `$VAR`.
    pub environment: &'a BTreeMap<String, String>,
    /// User account to run as.
    pub user: Option<&'a str>,
    /// Numeric uid; takes precedence over `user` for the id itself.
    pub user_id: Option<u32>,
    /// Group to run as; requires a user.
    pub group: Option<&'a str>,
    /// Numeric gid; takes precedence over `group` for the id itself.
    pub group_id: Option<u32>,
    /// Working directory.
    pub working_dir: Option<&'a str>,
}

/// Resolved uid/gid pair applied before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Uid the child runs as.
    pub uid: u32,
    /// Gid the child runs as.
    pub gid: u32,
}

/// Resolves the spec's user/group fields into concrete ids.
///
/// Declaring a group without any user is rejected; a user without a group
/// falls back to the account's primary group.
pub fn resolve_credentials(spec: &SpawnSpec<'_>) -> Result<Option<Credentials>, ServiceError> {
    let has_user = spec.user.is_some() || spec.user_id.is_some();
    let has_group = spec.group.is_some() || spec.group_id.is_some();
    if has_group && !has_user {
        return Err(ServiceError::GroupWithoutUser(spec.name.to_string()));
    }
    if !has_user {
        return Ok(None);
    }

    let account = match spec.user {
        Some(name) => {
            Some(
                User::from_name(name)
                    .map_err(|_| unknown_account(spec.name, "user", name))?
                    .ok_or_else(|| unknown_account(spec.name, "user", name))?,
            )
        }
        None => None,
    };

    let uid = spec
        .user_id
        .or_else(|| account.as_ref().map(|u| u.uid.as_raw()))
        .ok_or_else(|| ServiceError::Internal("user resolution missed".into()))?;

    let gid = match (spec.group_id, spec.group) {
        (Some(gid), _) => gid,
        (None, Some(name)) => Group::from_name(name)
            .map_err(|_| unknown_account(spec.name, "group", name))?
            .ok_or_else(|| unknown_account(spec.name, "group", name))?
            .gid
            .as_raw(),
        (None, None) => account
            .as_ref()
            .map(|u| u.gid.as_raw())
            .ok_or_else(|| unknown_account(spec.name, "group", "<primary>"))?,
    };

    Ok(Some(Credentials { uid, gid }))
}

fn unknown_account(service: &str, kind: &'static str, name: &str) -> ServiceError {
    ServiceError::UnknownAccount {
        service: service.to_string(),
        kind,
        name: name.to_string(),
    }
}

/// Expands `$VAR` and `${VAR}` references against the daemon environment.
/// Unknown variables expand to the empty string.
pub fn expand_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        env::var(name).unwrap_or_else(|_| {
            warn!("Environment variable {name} is not set; expanding to empty");
            String::new()
        })
    })
    .into_owned()
}

/// Builds the argv for the spec, honoring bracketed default arguments.
pub fn build_argv(spec: &SpawnSpec<'_>) -> Result<Vec<String>, ServiceError> {
    let (base, default_extra) =
        parse_command(spec.command).map_err(|reason| ServiceError::StartError {
            service: spec.name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, reason),
        })?;

    let mut argv = base;
    match spec.extra_args {
        Some(extra) => argv.extend(extra.iter().cloned()),
        None => {
            if let Some(extra) = default_extra {
                argv.extend(extra);
            }
        }
    }
    Ok(argv)
}

/// Spawns the child described by `spec`, wiring both output streams into
/// `output`. Returns the child handle; the caller owns exit tracking.
pub fn spawn_child(
    spec: &SpawnSpec<'_>,
    output: &OutputWriter,
) -> Result<Child, ServiceError> {
    let argv = build_argv(spec)?;
    let credentials = resolve_credentials(spec)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Own process group so a single signal reaches the whole subtree.
    cmd.process_group(0);

    if let Some(dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in spec.environment {
        cmd.env(key, expand_vars(value));
    }
    if let Some(creds) = credentials {
        cmd.uid(creds.uid);
        cmd.gid(creds.gid);
    }

    let mut child = cmd.spawn().map_err(|source| ServiceError::StartError {
        service: spec.name.to_string(),
        source,
    })?;
    debug!("Spawned \"{}\" as pid {}", spec.name, child.id());

    if let Some(stdout) = child.stdout.take() {
        forward_stream(spec.name, stdout, output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_stream(spec.name, stderr, output.clone());
    }

    Ok(child)
}

/// Copies one output stream into the ring buffer, line by line.
fn forward_stream(name: &str, reader: impl Read + Send + 'static, output: OutputWriter) {
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("out-{label}"))
        .spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                match line {
                    Ok(line) => output.write_line(&line),
                    Err(err) => {
                        debug!("Output stream for \"{label}\" closed: {err}");
                        return;
                    }
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|err| warn!("Cannot spawn output forwarder: {err}"));
}
