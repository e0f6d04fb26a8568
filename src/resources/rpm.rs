//! NR-023: RPM package resource (rpm + yum).

use super::package::{self, Transition};
use super::version::compare_rpm;
use super::{Converge, ResourceKind};
use crate::core::state::{Diff, PackageState, State};
use crate::error::{ConstructionError, ResourceError};
use crate::transport::{shell_arg, Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An RPM package at an optional version and release.
///
/// A release without a version is rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rpm {
    name: String,
    #[serde(
        default,
        deserialize_with = "package::opt_version",
        skip_serializing_if = "Option::is_none"
    )]
    version: Option<String>,
    #[serde(
        default,
        deserialize_with = "package::opt_version",
        skip_serializing_if = "Option::is_none"
    )]
    release: Option<String>,
    /// Value for `yum --disableexcludes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    disable_excludes: Option<String>,
    /// Undo removes by bare name, whatever version is installed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    remove_any_version: bool,
}

impl Rpm {
    pub fn new(
        name: &str,
        version: Option<&str>,
        release: Option<&str>,
    ) -> Result<Self, ConstructionError> {
        let rpm = Self {
            name: name.to_string(),
            version: version.map(str::to_string),
            release: release.map(str::to_string),
            disable_excludes: None,
            remove_any_version: false,
        };
        rpm.validate()?;
        Ok(rpm)
    }

    /// Build from manifest fields.
    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let rpm: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| ConstructionError::InvalidFields {
                kind: "rpm".to_string(),
                message: e.to_string(),
            })?;
        rpm.validate()?;
        Ok(rpm)
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        package::validate(
            "rpm",
            &self.name,
            self.version.as_deref(),
            self.release.as_deref(),
        )
    }

    pub fn disable_excludes(mut self, repo: &str) -> Self {
        self.disable_excludes = Some(repo.to_string());
        self
    }

    /// Opt in to name-based removal on undo. May remove a version this
    /// resource never installed.
    pub fn remove_any_version(mut self) -> Self {
        self.remove_any_version = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `name`, `name-version` or `name-version-release`.
    pub fn package_label(&self) -> String {
        label(&self.name, self.version.as_deref(), self.release.as_deref())
    }

    fn desired(&self) -> PackageState {
        PackageState::new(
            self.name.clone(),
            self.version.as_deref(),
            self.release.as_deref(),
        )
    }

    fn yum(&self, args: &str) -> String {
        match &self.disable_excludes {
            Some(repo) => format!("yum -y {} --disableexcludes {}", args, shell_arg(repo)),
            None => format!("yum -y {}", args),
        }
    }

    /// Mutating command for a transition.
    pub fn command_for(&self, transition: Transition) -> String {
        let label = shell_arg(&self.package_label());
        match transition {
            Transition::Install => self.yum(&format!("install {}", label)),
            Transition::Upgrade => self.yum(&format!("upgrade-to {}", label)),
            Transition::Downgrade => format!(
                "{} && {}",
                self.yum(&format!("remove {}", shell_arg(&self.name))),
                self.yum(&format!("install {}", label))
            ),
        }
    }

    /// Queried by bare name so an installed version other than the desired
    /// one is still observed.
    fn query_command(&self) -> String {
        format!(
            "rpm -q --queryformat '%{{NAME}} %{{VERSION}} %{{RELEASE}}\\n' {}",
            shell_arg(&self.name)
        )
    }

    fn parse_query(&self, output: &str) -> Result<State, ResourceError> {
        let line = package::single_line(&self.label(), output)?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [name, version, release] = parts.as_slice() else {
            return Err(ResourceError::malformed(
                self.label(),
                format!("expected 'NAME VERSION RELEASE', got '{}'", line),
                output,
            ));
        };
        if *name != self.name {
            return Err(ResourceError::malformed(
                self.label(),
                format!("query answered for package '{}'", name),
                output,
            ));
        }
        Ok(State::Package(PackageState::new(
            *name,
            Some(*version),
            Some(*release),
        )))
    }
}

fn label(name: &str, version: Option<&str>, release: Option<&str>) -> String {
    match (version, release) {
        (Some(v), Some(r)) => format!("{}-{}-{}", name, v, r),
        (Some(v), None) => format!("{}-{}", name, v),
        _ => name.to_string(),
    }
}

#[async_trait]
impl Converge for Rpm {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Rpm
    }

    fn label(&self) -> String {
        format!("rpm:{}", self.package_label())
    }

    fn state(&self) -> State {
        State::Package(self.desired())
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        match runner
            .run(ctx, &self.query_command(), &RunOptions::default())
            .await
        {
            Ok(output) => self.parse_query(&output),
            Err(e) if !e.is_cancellation() && e.output().contains("is not installed") => {
                Ok(State::Empty)
            }
            Err(e) => Err(ResourceError::query(self.label(), e)),
        }
    }

    fn is_different(&self, current: &State) -> bool {
        package::is_different(current, &self.desired())
    }

    async fn apply(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        diff: &Diff,
    ) -> Result<bool, ResourceError> {
        if !self.is_different(diff.current()) {
            return Ok(false);
        }
        let Some(transition) = package::transition(diff.current(), &self.desired(), compare_rpm)
        else {
            return Ok(false);
        };
        let cmd = self.command_for(transition);
        runner
            .run(ctx, &cmd, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::apply(self.label(), &cmd, e))?;
        Ok(true)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        _current: &State,
    ) -> Result<(), ResourceError> {
        let target = if self.remove_any_version {
            self.name.clone()
        } else {
            self.package_label()
        };
        let cmd = self.yum(&format!("remove {}", shell_arg(&target)));
        runner
            .run(ctx, &cmd, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::undo(self.label(), &cmd, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::transport::fake::FakeRunner;
    use std::sync::{Arc, Mutex};

    fn httpd() -> Rpm {
        Rpm::new("httpd", Some("2.4"), Some("6")).unwrap()
    }

    /// A host whose rpm database holds at most one httpd version.
    fn httpd_host(installed: Option<(&str, &str)>) -> (FakeRunner, Arc<Mutex<Option<(String, String)>>>) {
        let db = Arc::new(Mutex::new(
            installed.map(|(v, r)| (v.to_string(), r.to_string())),
        ));
        let state = Arc::clone(&db);
        let runner = FakeRunner::with_handler(move |cmd| {
            let mut db = state.lock().unwrap();
            if cmd.starts_with("rpm -q") {
                return Some(match &*db {
                    Some((v, r)) => Ok(format!("httpd {} {}\n", v, r)),
                    None => Err(RunError::Exit {
                        exit_code: 1,
                        output: "package httpd is not installed\n".to_string(),
                    }),
                });
            }
            if cmd.ends_with("install httpd-2.4-6") || cmd.contains("upgrade-to httpd-2.4-6") {
                *db = Some(("2.4".to_string(), "6".to_string()));
                return Some(Ok(String::new()));
            }
            if cmd.starts_with("yum -y remove") {
                *db = None;
                return Some(Ok(String::new()));
            }
            None
        });
        (runner, db)
    }

    async fn observe_and_apply(rpm: &Rpm, runner: &FakeRunner) -> bool {
        let ctx = Context::background();
        let current = rpm.query_state(&ctx, runner).await.unwrap();
        let diff = Diff::new(rpm.state(), current);
        rpm.apply(&ctx, runner, &diff).await.unwrap()
    }

    fn mutating(runner: &FakeRunner) -> Vec<String> {
        runner
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("yum"))
            .collect()
    }

    #[test]
    fn test_nr023_release_without_version_rejected() {
        let err = Rpm::new("httpd", None, Some("6")).unwrap_err();
        assert!(matches!(err, ConstructionError::ReleaseWithoutVersion { .. }));
    }

    #[test]
    fn test_nr023_labels() {
        assert_eq!(httpd().package_label(), "httpd-2.4-6");
        assert_eq!(
            Rpm::new("httpd", Some("2.4"), None).unwrap().package_label(),
            "httpd-2.4"
        );
        assert_eq!(Rpm::new("httpd", None, None).unwrap().package_label(), "httpd");
    }

    #[test]
    fn test_nr023_query_command() {
        assert_eq!(
            httpd().query_command(),
            "rpm -q --queryformat '%{NAME} %{VERSION} %{RELEASE}\\n' httpd"
        );
    }

    #[tokio::test]
    async fn test_nr023_not_installed_is_empty() {
        let runner = FakeRunner::new();
        runner.fail("rpm -q", 1, "package httpd is not installed\n");
        let state = httpd()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_nr023_other_failure_is_query_error() {
        let runner = FakeRunner::new();
        runner.fail("rpm -q", 1, "error: rpmdb open failed\n");
        let err = httpd()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Query { .. }));
        assert!(err.output().contains("rpmdb open failed"));
    }

    #[tokio::test]
    async fn test_nr023_multiple_lines_rejected() {
        let runner = FakeRunner::new();
        runner.respond("rpm -q", "httpd 2.4 6\nhttpd 2.4 7\n");
        let err = httpd()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[tokio::test]
    async fn test_nr023_missing_field_rejected() {
        let runner = FakeRunner::new();
        runner.respond("rpm -q", "httpd 2.4\n");
        let err = httpd()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NAME VERSION RELEASE"));
    }

    #[tokio::test]
    async fn test_nr023_would_change_state_matches_installed() {
        let (runner, _) = httpd_host(Some(("2.4", "6")));
        let changed = httpd()
            .would_change_state(&Context::background(), &runner)
            .await
            .unwrap();
        assert!(!changed);
        assert!(mutating(&runner).is_empty());
    }

    #[tokio::test]
    async fn test_nr023_upgrade_from_older() {
        let (runner, _) = httpd_host(Some(("2.2", "1")));
        assert!(observe_and_apply(&httpd(), &runner).await);
        assert_eq!(mutating(&runner), vec!["yum -y upgrade-to httpd-2.4-6"]);
    }

    #[tokio::test]
    async fn test_nr023_install_when_absent() {
        let (runner, _) = httpd_host(None);
        assert!(observe_and_apply(&httpd(), &runner).await);
        assert_eq!(mutating(&runner), vec!["yum -y install httpd-2.4-6"]);
    }

    #[tokio::test]
    async fn test_nr023_downgrade_removes_then_installs() {
        let (runner, _) = httpd_host(Some(("2.4", "9")));
        assert!(observe_and_apply(&httpd(), &runner).await);
        assert_eq!(
            mutating(&runner),
            vec!["yum -y remove httpd && yum -y install httpd-2.4-6"]
        );
    }

    #[test]
    fn test_nr023_label_ordering_tie_break() {
        let current = State::Package(PackageState::new("foo", Some("1.0"), Some("1")));
        let up = Rpm::new("foo", Some("2.0"), Some("1")).unwrap();
        let down = Rpm::new("foo", Some("0.5"), Some("1")).unwrap();
        let same = Rpm::new("foo", Some("1.0"), Some("1")).unwrap();
        assert_eq!(
            package::transition(&current, &up.desired(), compare_rpm),
            Some(Transition::Upgrade)
        );
        assert_eq!(
            package::transition(&current, &down.desired(), compare_rpm),
            Some(Transition::Downgrade)
        );
        assert!(!same.is_different(&current));
    }

    #[tokio::test]
    async fn test_nr023_apply_is_idempotent() {
        let (runner, db) = httpd_host(Some(("2.2", "1")));
        let rpm = httpd();
        assert!(observe_and_apply(&rpm, &runner).await);
        let after_first = mutating(&runner).len();
        assert!(!observe_and_apply(&rpm, &runner).await);
        assert_eq!(mutating(&runner).len(), after_first);
        assert_eq!(
            db.lock().unwrap().clone(),
            Some(("2.4".to_string(), "6".to_string()))
        );
    }

    #[tokio::test]
    async fn test_nr023_underspecified_desired_not_reinstalled() {
        let (runner, _) = httpd_host(Some(("2.4", "6")));
        let rpm = Rpm::new("httpd", Some("2.4"), None).unwrap();
        assert!(!observe_and_apply(&rpm, &runner).await);
        assert!(mutating(&runner).is_empty());
    }

    #[test]
    fn test_nr023_disable_excludes_on_every_yum() {
        let rpm = httpd().disable_excludes("kubernetes");
        assert_eq!(
            rpm.command_for(Transition::Install),
            "yum -y install httpd-2.4-6 --disableexcludes kubernetes"
        );
        assert_eq!(
            rpm.command_for(Transition::Downgrade),
            "yum -y remove httpd --disableexcludes kubernetes && \
             yum -y install httpd-2.4-6 --disableexcludes kubernetes"
        );
    }

    #[tokio::test]
    async fn test_nr023_undo_targets_exact_label_by_default() {
        let runner = FakeRunner::new();
        httpd()
            .undo(&Context::background(), &runner, &State::Empty)
            .await
            .unwrap();
        assert_eq!(runner.commands(), vec!["yum -y remove httpd-2.4-6"]);

        let runner = FakeRunner::new();
        httpd()
            .remove_any_version()
            .undo(&Context::background(), &runner, &State::Empty)
            .await
            .unwrap();
        assert_eq!(runner.commands(), vec!["yum -y remove httpd"]);
    }

    #[tokio::test]
    async fn test_nr023_apply_failure_carries_command_and_output() {
        let runner = FakeRunner::new();
        runner.fail("yum", 1, "No package httpd-2.4-6 available.\n");
        let diff = Diff::new(httpd().state(), State::Empty);
        let err = httpd()
            .apply(&Context::background(), &runner, &diff)
            .await
            .unwrap_err();
        match &err {
            ResourceError::Apply { command, .. } => {
                assert_eq!(command, "yum -y install httpd-2.4-6")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.output().contains("No package"));
    }

    #[test]
    fn test_nr023_from_fields() {
        let yaml = "name: kubelet\nversion: 1.14.1\nrelease: \"0\"\ndisable_excludes: kubernetes\n";
        let rpm = Rpm::from_fields(serde_yaml_ng::from_str(yaml).unwrap()).unwrap();
        assert_eq!(rpm.package_label(), "kubelet-1.14.1-0");
        let bad = Rpm::from_fields(serde_yaml_ng::from_str("name: x\nrelease: \"1\"\n").unwrap());
        assert!(matches!(bad, Err(ConstructionError::ReleaseWithoutVersion { .. })));
        let unknown = Rpm::from_fields(serde_yaml_ng::from_str("name: x\ncolour: red\n").unwrap());
        assert!(matches!(unknown, Err(ConstructionError::InvalidFields { .. })));
    }

    #[test]
    fn test_nr023_float_version_rejected() {
        let err = Rpm::from_fields(serde_yaml_ng::from_str("name: kubelet\nversion: 1.10\n").unwrap())
            .unwrap_err();
        match err {
            ConstructionError::InvalidFields { message, .. } => {
                assert!(message.contains("quote it"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let quoted =
            Rpm::from_fields(serde_yaml_ng::from_str("name: kubelet\nversion: \"1.10\"\n").unwrap())
                .unwrap();
        assert_eq!(quoted.package_label(), "kubelet-1.10");
        let int = Rpm::from_fields(serde_yaml_ng::from_str("name: kubelet\nversion: 2\n").unwrap())
            .unwrap();
        assert_eq!(int.package_label(), "kubelet-2");
    }
}
