//! Layered plan model for warden.
//!
//! A plan is composed from ordered YAML layers stored as `NNN-label.yaml`
//! files. Flattening walks layers low-to-high, applying each entry's
//! `override` policy (`replace` drops the prior definition, `merge` combines
//! field-wise). The flattened plan is validated as a whole: every reference
//! must resolve and the service dependency graph must be acyclic.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    constants::{
        DEFAULT_BACKOFF_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_BACKOFF_LIMIT,
        DEFAULT_CHECK_PERIOD, DEFAULT_CHECK_THRESHOLD, DEFAULT_CHECK_TIMEOUT,
        DEFAULT_KILL_DELAY,
    },
    error::PlanError,
};

/// Per-entry layering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    /// No policy declared; only valid for the first definition of a name.
    #[default]
    #[serde(skip)]
    Unset,
    /// Field-wise merge into the prior definition.
    Merge,
    /// Drop the prior definition entirely.
    Replace,
}

impl Override {
    /// True when no policy was declared.
    pub fn is_unset(&self) -> bool {
        matches!(self, Override::Unset)
    }
}

/// Whether a service participates in autostart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    /// Not declared; treated as disabled for autostart purposes.
    #[default]
    #[serde(skip)]
    Unset,
    /// Started by the autostart operation.
    Enabled,
    /// Only started on explicit request.
    Disabled,
}

impl Startup {
    /// True when no value was declared.
    pub fn is_unset(&self) -> bool {
        matches!(self, Startup::Unset)
    }
}

/// Action applied when a service exits or a check crosses its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    /// Restart the service, consulting the backoff schedule.
    Restart,
    /// Tear down the whole daemon.
    Shutdown,
    /// Leave the service inactive.
    Ignore,
}

/// Configuration for an individual service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceConfig {
    /// Layering policy for this entry.
    #[serde(
        default,
        rename = "override",
        skip_serializing_if = "Override::is_unset"
    )]
    pub override_: Override,
    /// Command used to start the service, with optional `[ default-args ]`.
    #[serde(default)]
    pub command: String,
    /// Short human-readable summary.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Autostart participation.
    #[serde(default, skip_serializing_if = "Startup::is_unset")]
    pub startup: Startup,
    /// Services this one should be started after (ordering hint only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Services this one should be started before (ordering hint only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    /// Services that must be part of any start closure containing this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Environment overlaid on the daemon environment; values may use `$VAR`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// User account the child runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Numeric uid; takes precedence over `user` for the id itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    /// Group the child runs as; requires `user` or `user-id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Numeric gid; takes precedence over `group` for the id itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    /// Working directory of the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Action on exit with code 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<ServiceAction>,
    /// Action on non-zero or signalled exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<ServiceAction>,
    /// Fallback action when the more specific hooks are unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<ServiceAction>,
    /// Action per named check once it crosses its threshold.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_check_failure: BTreeMap<String, ServiceAction>,
    /// Initial automatic restart delay.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub backoff_delay: Option<Duration>,
    /// Multiplier applied to the delay after each restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    /// Upper bound on the restart delay.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub backoff_limit: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub kill_delay: Option<Duration>,
}

impl ServiceConfig {
    /// Effective initial backoff delay.
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay.unwrap_or(DEFAULT_BACKOFF_DELAY)
    }

    /// Effective backoff factor.
    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor.unwrap_or(DEFAULT_BACKOFF_FACTOR)
    }

    /// Effective backoff ceiling.
    pub fn backoff_limit(&self) -> Duration {
        self.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT)
    }

    /// Effective SIGTERM-to-SIGKILL grace period.
    pub fn kill_delay(&self) -> Duration {
        self.kill_delay.unwrap_or(DEFAULT_KILL_DELAY)
    }

    /// Resolves the exit action for the given outcome, with its reason tag.
    ///
    /// A failed exit consults `on-failure` (default restart); a clean exit
    /// consults `on-success`, falling back to `on-exit` (default restart)
    /// when unset.
    pub fn exit_action(&self, failed: bool) -> (ServiceAction, &'static str) {
        if failed {
            (
                self.on_failure.unwrap_or(ServiceAction::Restart),
                "on-failure",
            )
        } else if let Some(action) = self.on_success {
            (action, "on-success")
        } else {
            (self.on_exit.unwrap_or(ServiceAction::Restart), "on-exit")
        }
    }

    /// Splits the command into base words and the optional bracketed
    /// default-arguments segment.
    pub fn command_words(&self) -> Result<(Vec<String>, Option<Vec<String>>), PlanError> {
        parse_command(&self.command).map_err(|reason| PlanError::InvalidCommand {
            service: String::new(),
            reason,
        })
    }

    fn merge_from(&mut self, other: &ServiceConfig) {
        if !other.command.is_empty() {
            self.command = other.command.clone();
        }
        if !other.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if !other.description.is_empty() {
            self.description = other.description.clone();
        }
        if !other.startup.is_unset() {
            self.startup = other.startup;
        }
        self.after.extend(other.after.iter().cloned());
        self.before.extend(other.before.iter().cloned());
        self.requires.extend(other.requires.iter().cloned());
        self.environment
            .extend(other.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        if other.user.is_some() {
            self.user = other.user.clone();
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if other.group.is_some() {
            self.group = other.group.clone();
        }
        if other.group_id.is_some() {
            self.group_id = other.group_id;
        }
        if other.working_dir.is_some() {
            self.working_dir = other.working_dir.clone();
        }
        if other.on_success.is_some() {
            self.on_success = other.on_success;
        }
        if other.on_failure.is_some() {
            self.on_failure = other.on_failure;
        }
        if other.on_exit.is_some() {
            self.on_exit = other.on_exit;
        }
        self.on_check_failure
            .extend(other.on_check_failure.iter().map(|(k, v)| (k.clone(), *v)));
        if other.backoff_delay.is_some() {
            self.backoff_delay = other.backoff_delay;
        }
        if other.backoff_factor.is_some() {
            self.backoff_factor = other.backoff_factor;
        }
        if other.backoff_limit.is_some() {
            self.backoff_limit = other.backoff_limit;
        }
        if other.kill_delay.is_some() {
            self.kill_delay = other.kill_delay;
        }
    }
}

/// Splits a command into base words and the optional `[ ... ]` segment.
pub fn parse_command(command: &str) -> Result<(Vec<String>, Option<Vec<String>>), String> {
    let words = shlex::split(command)
        .ok_or_else(|| "cannot split command into words".to_string())?;
    if words.is_empty() {
        return Err("command is empty".to_string());
    }

    let open = words.iter().position(|w| w == "[");
    match open {
        None => {
            if words.iter().any(|w| w == "]") {
                return Err("unexpected \"]\" without matching \"[\"".to_string());
            }
            Ok((words, None))
        }
        Some(at) => {
            if at == 0 {
                return Err("command cannot start with \"[\"".to_string());
            }
            if words.last().map(String::as_str) != Some("]") {
                return Err("\"[\" must be closed by a trailing \"]\"".to_string());
            }
            let base = words[..at].to_vec();
            let extra = words[at + 1..words.len() - 1].to_vec();
            if extra.iter().any(|w| w == "[" || w == "]") {
                return Err("nested brackets are not allowed".to_string());
            }
            Ok((base, Some(extra)))
        }
    }
}

/// Level at which a check contributes to health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    /// No level declared; such checks count at every health level.
    #[default]
    Unset,
    /// Liveness: counted at every health level.
    Alive,
    /// Readiness: only counted when ready-level health is requested.
    Ready,
}

impl CheckLevel {
    /// True when no level was declared.
    pub fn is_unset(&self) -> bool {
        matches!(self, CheckLevel::Unset)
    }
}

/// HTTP probe definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpCheck {
    /// URL fetched with GET.
    pub url: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// TCP probe definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpCheck {
    /// Host to connect to; defaults to localhost.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Port to connect to.
    pub port: u16,
}

/// Exec probe definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecCheck {
    /// Command to run; non-zero exit is a failure.
    pub command: String,
    /// Environment overlaid on the daemon environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// User account the probe runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Group the probe runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Working directory of the probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Configuration for an individual health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckConfig {
    /// Layering policy for this entry.
    #[serde(
        default,
        rename = "override",
        skip_serializing_if = "Override::is_unset"
    )]
    pub override_: Override,
    /// Health level this check reports at.
    #[serde(default, skip_serializing_if = "CheckLevel::is_unset")]
    pub level: CheckLevel,
    /// Interval between probes.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub period: Option<Duration>,
    /// Timeout for a single probe.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Consecutive failures before the check goes down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    /// HTTP probe; exactly one probe kind must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,
    /// TCP probe; exactly one probe kind must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,
    /// Exec probe; exactly one probe kind must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
}

impl CheckConfig {
    /// Effective probe interval.
    pub fn period(&self) -> Duration {
        self.period.unwrap_or(DEFAULT_CHECK_PERIOD)
    }

    /// Effective probe timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_CHECK_TIMEOUT)
    }

    /// Effective failure threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold.unwrap_or(DEFAULT_CHECK_THRESHOLD)
    }

    fn merge_from(&mut self, other: &CheckConfig) {
        if !other.level.is_unset() {
            self.level = other.level;
        }
        if other.period.is_some() {
            self.period = other.period;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.threshold.is_some() {
            self.threshold = other.threshold;
        }
        // Probe kinds replace wholesale; merging two half-probes would be
        // impossible to validate sensibly.
        if other.http.is_some() || other.tcp.is_some() || other.exec.is_some() {
            self.http = other.http.clone();
            self.tcp = other.tcp.clone();
            self.exec = other.exec.clone();
        }
    }
}

/// Kind of sink a log target forwards to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTargetType {
    /// No type declared.
    #[default]
    #[serde(skip)]
    Unset,
    /// Append formatted lines to a local file.
    File,
}

impl LogTargetType {
    /// True when no type was declared.
    pub fn is_unset(&self) -> bool {
        matches!(self, LogTargetType::Unset)
    }
}

/// Configuration for a log forwarding target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogTargetConfig {
    /// Layering policy for this entry.
    #[serde(
        default,
        rename = "override",
        skip_serializing_if = "Override::is_unset"
    )]
    pub override_: Override,
    /// Sink kind.
    #[serde(default, rename = "type", skip_serializing_if = "LogTargetType::is_unset")]
    pub target_type: LogTargetType,
    /// Sink location (file path for `file` targets).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    /// Services whose output is forwarded; `all` selects every service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

impl LogTargetConfig {
    /// True when this target selects the named service.
    pub fn selects(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == "all" || s == service)
    }

    fn merge_from(&mut self, other: &LogTargetConfig) {
        if !other.target_type.is_unset() {
            self.target_type = other.target_type;
        }
        if !other.location.is_empty() {
            self.location = other.location.clone();
        }
        self.services.extend(other.services.iter().cloned());
    }
}

/// One ordered YAML fragment of configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Layer {
    /// Position in the layer stack; assigned from the filename prefix.
    #[serde(skip)]
    pub order: i32,
    /// Unique label; assigned from the filename.
    #[serde(skip)]
    pub label: String,
    /// Short human-readable summary.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Service entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Check entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckConfig>,
    /// Log target entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_targets: BTreeMap<String, LogTargetConfig>,
}

impl Layer {
    /// Parses a layer from YAML text, attaching label and order.
    pub fn parse(label: &str, order: i32, yaml: &str) -> Result<Layer, PlanError> {
        let mut layer: Layer = serde_yaml::from_str(yaml)?;
        layer.label = label.to_string();
        layer.order = order;
        Ok(layer)
    }

    fn combine_from(&mut self, other: &Layer) {
        if !other.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if !other.description.is_empty() {
            self.description = other.description.clone();
        }
        for (name, svc) in &other.services {
            match (svc.override_, self.services.get_mut(name)) {
                (Override::Merge, Some(existing)) => existing.merge_from(svc),
                _ => {
                    self.services.insert(name.clone(), svc.clone());
                }
            }
        }
        for (name, check) in &other.checks {
            match (check.override_, self.checks.get_mut(name)) {
                (Override::Merge, Some(existing)) => existing.merge_from(check),
                _ => {
                    self.checks.insert(name.clone(), check.clone());
                }
            }
        }
        for (name, target) in &other.log_targets {
            match (target.override_, self.log_targets.get_mut(name)) {
                (Override::Merge, Some(existing)) => existing.merge_from(target),
                _ => {
                    self.log_targets.insert(name.clone(), target.clone());
                }
            }
        }
    }
}

/// The effective, flattened configuration.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Plan {
    /// Effective services keyed by name.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Effective checks keyed by name.
    pub checks: BTreeMap<String, CheckConfig>,
    /// Effective log targets keyed by name.
    pub log_targets: BTreeMap<String, LogTargetConfig>,
}

impl Plan {
    /// Renders the plan as YAML for the control plane.
    pub fn to_yaml(&self) -> Result<String, PlanError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Names of services with `startup: enabled`.
    pub fn autostart_names(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, svc)| svc.startup == Startup::Enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Flattens ordered layers into an effective plan.
///
/// An entry redefining an existing name must carry an explicit `override`
/// policy; the first definition of a name may leave it unset.
pub fn flatten(layers: &[Layer]) -> Result<Plan, PlanError> {
    let mut plan = Plan::default();

    for layer in layers {
        for (name, svc) in &layer.services {
            apply_entry(
                &mut plan.services,
                name,
                svc,
                svc.override_,
                "service",
                ServiceConfig::merge_from,
            )?;
        }
        for (name, check) in &layer.checks {
            apply_entry(
                &mut plan.checks,
                name,
                check,
                check.override_,
                "check",
                CheckConfig::merge_from,
            )?;
        }
        for (name, target) in &layer.log_targets {
            apply_entry(
                &mut plan.log_targets,
                name,
                target,
                target.override_,
                "log target",
                LogTargetConfig::merge_from,
            )?;
        }
    }

    for svc in plan.services.values_mut() {
        svc.override_ = Override::Unset;
    }
    for check in plan.checks.values_mut() {
        check.override_ = Override::Unset;
    }
    for target in plan.log_targets.values_mut() {
        target.override_ = Override::Unset;
    }

    Ok(plan)
}

fn apply_entry<T: Clone>(
    map: &mut BTreeMap<String, T>,
    name: &str,
    entry: &T,
    policy: Override,
    kind: &'static str,
    merge: impl Fn(&mut T, &T),
) -> Result<(), PlanError> {
    match (policy, map.get_mut(name)) {
        (Override::Merge, Some(existing)) => merge(existing, entry),
        (Override::Replace, _) | (Override::Merge, None) => {
            map.insert(name.to_string(), entry.clone());
        }
        (Override::Unset, None) => {
            map.insert(name.to_string(), entry.clone());
        }
        (Override::Unset, Some(_)) => {
            return Err(PlanError::InvalidField {
                kind,
                name: name.to_string(),
                field: "override",
                reason: "must be \"merge\" or \"replace\" for an existing entry".into(),
            });
        }
    }
    Ok(())
}

/// Validates a flattened plan.
pub fn validate(plan: &Plan) -> Result<(), PlanError> {
    for (name, svc) in &plan.services {
        parse_command(&svc.command).map_err(|reason| PlanError::InvalidCommand {
            service: name.clone(),
            reason,
        })?;

        if let Some(factor) = svc.backoff_factor
            && factor < 1.0
        {
            return Err(PlanError::InvalidField {
                kind: "service",
                name: name.clone(),
                field: "backoff-factor",
                reason: format!("{factor} is less than 1.0"),
            });
        }

        for dep in svc
            .requires
            .iter()
            .chain(svc.before.iter())
            .chain(svc.after.iter())
        {
            if !plan.services.contains_key(dep) {
                return Err(PlanError::UnknownReference {
                    service: name.clone(),
                    kind: "service",
                    name: dep.clone(),
                });
            }
        }

        for check in svc.on_check_failure.keys() {
            if !plan.checks.contains_key(check) {
                return Err(PlanError::UnknownReference {
                    service: name.clone(),
                    kind: "check",
                    name: check.clone(),
                });
            }
        }
    }

    for (name, check) in &plan.checks {
        let probes =
            check.http.is_some() as u8 + check.tcp.is_some() as u8 + check.exec.is_some() as u8;
        if probes != 1 {
            return Err(PlanError::InvalidField {
                kind: "check",
                name: name.clone(),
                field: "http/tcp/exec",
                reason: "exactly one probe kind must be configured".into(),
            });
        }
        if let Some(threshold) = check.threshold
            && threshold < 1
        {
            return Err(PlanError::InvalidField {
                kind: "check",
                name: name.clone(),
                field: "threshold",
                reason: "must be at least 1".into(),
            });
        }
        if let Some(period) = check.period
            && period.is_zero()
        {
            return Err(PlanError::InvalidField {
                kind: "check",
                name: name.clone(),
                field: "period",
                reason: "must be greater than zero".into(),
            });
        }
    }

    for (name, target) in &plan.log_targets {
        if target.target_type.is_unset() {
            return Err(PlanError::InvalidField {
                kind: "log target",
                name: name.clone(),
                field: "type",
                reason: "must be specified".into(),
            });
        }
        if target.location.is_empty() {
            return Err(PlanError::InvalidField {
                kind: "log target",
                name: name.clone(),
                field: "location",
                reason: "must not be empty".into(),
            });
        }
    }

    // Cycle detection over the whole service set.
    let all: Vec<String> = plan.services.keys().cloned().collect();
    start_order(plan, &all)?;

    Ok(())
}

/// Computes the start order for the requested services.
///
/// The returned list is the topologically sorted closure over `requires`
/// edges; `before`/`after` hints break ties, and remaining ties resolve
/// lexicographically so the order is deterministic.
pub fn start_order(plan: &Plan, names: &[String]) -> Result<Vec<String>, PlanError> {
    // Closure over requires.
    let mut members: BTreeSet<String> = BTreeSet::new();
    let mut pending: Vec<String> = names.to_vec();
    while let Some(name) = pending.pop() {
        let svc = plan
            .services
            .get(&name)
            .ok_or_else(|| PlanError::UnknownReference {
                service: name.clone(),
                kind: "service",
                name: name.clone(),
            })?;
        if members.insert(name.clone()) {
            pending.extend(svc.requires.iter().cloned());
        }
    }

    // Edge u -> v means u starts before v.
    let mut indegree: HashMap<String, usize> =
        members.iter().map(|name| (name.clone(), 0)).collect();
    let mut edges: HashMap<String, BTreeSet<String>> = HashMap::new();

    fn add_edge(
        members: &BTreeSet<String>,
        edges: &mut HashMap<String, BTreeSet<String>>,
        indegree: &mut HashMap<String, usize>,
        from: &str,
        to: &str,
    ) {
        if !members.contains(from) || !members.contains(to) {
            return;
        }
        if edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string())
            && let Some(deg) = indegree.get_mut(to)
        {
            *deg += 1;
        }
    }

    for name in &members {
        let svc = &plan.services[name];
        for dep in &svc.requires {
            add_edge(&members, &mut edges, &mut indegree, dep, name);
        }
        for later in &svc.before {
            add_edge(&members, &mut edges, &mut indegree, name, later);
        }
        for earlier in &svc.after {
            add_edge(&members, &mut edges, &mut indegree, earlier, name);
        }
    }

    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut order = Vec::with_capacity(members.len());

    while let Some(name) = ready.pop_first() {
        if let Some(children) = edges.get(&name) {
            for child in children {
                if let Some(deg) = indegree.get_mut(child) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }
        order.push(name);
    }

    if order.len() != members.len() {
        let remaining: Vec<String> = indegree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(name, _)| name)
            .collect();
        return Err(PlanError::DependencyCycle {
            cycle: remaining.join(" -> "),
        });
    }

    Ok(order)
}

type PlanListener = Arc<dyn Fn(&Plan) + Send + Sync>;

struct PlanInner {
    layers: Vec<Layer>,
    plan: Arc<Plan>,
}

/// Owns the layer stack and the flattened plan derived from it.
pub struct PlanManager {
    layers_dir: PathBuf,
    inner: Mutex<PlanInner>,
    listeners: Mutex<Vec<PlanListener>>,
}

impl std::fmt::Debug for PlanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanManager")
            .field("layers_dir", &self.layers_dir)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PlanInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanInner")
            .field("layers", &self.layers)
            .field("plan", &self.plan)
            .finish()
    }
}

impl PlanManager {
    /// Reads all layer files in filename order and flattens them.
    pub fn load(layers_dir: &Path) -> Result<Self, PlanError> {
        fs::create_dir_all(layers_dir)?;

        let mut files: Vec<PathBuf> = fs::read_dir(layers_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().and_then(|e| e.to_str()) == Some("yaml") && path.is_file()
            })
            .collect();
        files.sort();

        let mut layers = Vec::with_capacity(files.len());
        let mut labels = BTreeSet::new();
        for path in &files {
            let (order, label) = parse_layer_filename(path)?;
            if !labels.insert(label.clone()) {
                return Err(PlanError::LabelExists(label));
            }
            let yaml = fs::read_to_string(path)?;
            layers.push(Layer::parse(&label, order, &yaml)?);
            debug!("Loaded layer \"{label}\" from {path:?}");
        }

        let plan = flatten(&layers)?;
        validate(&plan)?;

        Ok(Self {
            layers_dir: layers_dir.to_path_buf(),
            inner: Mutex::new(PlanInner {
                layers,
                plan: Arc::new(plan),
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Returns the current flattened plan.
    pub fn plan(&self) -> Arc<Plan> {
        Arc::clone(&self.lock_inner().plan)
    }

    /// Registers a listener invoked synchronously on every successful plan
    /// mutation. Listeners must not call back into plan mutators.
    pub fn add_change_listener(&self, listener: impl Fn(&Plan) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Appends a new layer on top of the stack.
    ///
    /// Fails with [`PlanError::LabelExists`] when the label is taken; the
    /// layer file is written with the next order prefix.
    pub fn append_layer(&self, mut layer: Layer) -> Result<i32, PlanError> {
        let plan = {
            let mut inner = self.lock_inner();
            if inner.layers.iter().any(|l| l.label == layer.label) {
                return Err(PlanError::LabelExists(layer.label));
            }

            let order = inner.layers.last().map(|l| l.order).unwrap_or(0) + 1;
            layer.order = order;

            let mut layers = inner.layers.clone();
            layers.push(layer.clone());
            let plan = flatten(&layers)?;
            validate(&plan)?;

            self.write_layer_file(&layer)?;
            inner.layers = layers;
            inner.plan = Arc::new(plan);
            Arc::clone(&inner.plan)
        };

        self.notify(&plan);
        Ok(layer.order)
    }

    /// Merges the given layer into the existing layer with the same label,
    /// or appends it when no such layer exists.
    pub fn combine_layer(&self, layer: Layer) -> Result<i32, PlanError> {
        let existing = {
            let inner = self.lock_inner();
            inner.layers.iter().position(|l| l.label == layer.label)
        };

        let Some(index) = existing else {
            return self.append_layer(layer);
        };

        let (order, plan) = {
            let mut inner = self.lock_inner();
            let mut layers = inner.layers.clone();
            layers[index].combine_from(&layer);
            let combined = layers[index].clone();

            let plan = flatten(&layers)?;
            validate(&plan)?;

            self.write_layer_file(&combined)?;
            inner.layers = layers;
            inner.plan = Arc::new(plan);
            (combined.order, Arc::clone(&inner.plan))
        };

        self.notify(&plan);
        Ok(order)
    }

    fn write_layer_file(&self, layer: &Layer) -> Result<(), PlanError> {
        let path = self
            .layers_dir
            .join(format!("{:03}-{}.yaml", layer.order, layer.label));
        let yaml = serde_yaml::to_string(layer)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    fn notify(&self, plan: &Plan) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener(plan);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PlanInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_layer_filename(path: &Path) -> Result<(i32, String), PlanError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let invalid = || PlanError::InvalidField {
        kind: "layer",
        name: stem.to_string(),
        field: "filename",
        reason: "expected NNN-label.yaml".into(),
    };

    let (prefix, label) = stem.split_once('-').ok_or_else(invalid)?;
    let order: i32 = prefix.parse().map_err(|_| invalid())?;
    if label.is_empty() {
        return Err(invalid());
    }
    Ok((order, label.to_string()))
}
