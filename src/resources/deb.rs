//! NR-024: Debian package resource (dpkg + apt-get).

use super::package::{self, Transition};
use super::version::{compare_deb, split_deb_version};
use super::{Converge, ResourceKind};
use crate::core::state::{Diff, PackageState, State};
use crate::error::{ConstructionError, ResourceError};
use crate::transport::{shell_arg, Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const APT: &str = "DEBIAN_FRONTEND=noninteractive apt-get";

/// A Debian package at an optional `[epoch:]upstream` version and revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deb {
    name: String,
    #[serde(
        default,
        deserialize_with = "package::opt_version",
        skip_serializing_if = "Option::is_none"
    )]
    version: Option<String>,
    /// Debian revision (the part after the last `-`).
    #[serde(
        default,
        deserialize_with = "package::opt_version",
        skip_serializing_if = "Option::is_none"
    )]
    release: Option<String>,
    /// Pass `--allow-change-held-packages` to installs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    allow_held: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    remove_any_version: bool,
}

impl Deb {
    pub fn new(
        name: &str,
        version: Option<&str>,
        release: Option<&str>,
    ) -> Result<Self, ConstructionError> {
        let deb = Self {
            name: name.to_string(),
            version: version.map(str::to_string),
            release: release.map(str::to_string),
            allow_held: false,
            remove_any_version: false,
        };
        deb.validate()?;
        Ok(deb)
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let deb: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| ConstructionError::InvalidFields {
                kind: "deb".to_string(),
                message: e.to_string(),
            })?;
        deb.validate()?;
        Ok(deb)
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        package::validate(
            "deb",
            &self.name,
            self.version.as_deref(),
            self.release.as_deref(),
        )
    }

    pub fn allow_held(mut self) -> Self {
        self.allow_held = true;
        self
    }

    pub fn remove_any_version(mut self) -> Self {
        self.remove_any_version = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// apt pin: `name`, `name=version-*` or `name=version-revision`.
    ///
    /// apt matches `=` exactly, so a version without revision pins with a
    /// glob over the revision.
    pub fn pin(&self) -> String {
        match (&self.version, &self.release) {
            (Some(v), Some(r)) => format!("{}={}-{}", self.name, v, r),
            (Some(v), None) => format!("{}={}-*", self.name, v),
            _ => self.name.clone(),
        }
    }

    fn desired(&self) -> PackageState {
        PackageState::new(
            self.name.clone(),
            self.version.as_deref(),
            self.release.as_deref(),
        )
    }

    fn install(&self, extra: &str) -> String {
        let mut cmd = format!("{} install -y", APT);
        if !extra.is_empty() {
            cmd.push(' ');
            cmd.push_str(extra);
        }
        if self.allow_held {
            cmd.push_str(" --allow-change-held-packages");
        }
        cmd.push(' ');
        cmd.push_str(&shell_arg(&self.pin()));
        cmd
    }

    pub fn command_for(&self, transition: Transition) -> String {
        match transition {
            Transition::Install => self.install(""),
            Transition::Upgrade => self.install("--only-upgrade"),
            Transition::Downgrade => format!(
                "{} remove -y {} && {}",
                APT,
                shell_arg(&self.name),
                self.install("")
            ),
        }
    }

    fn query_command(&self) -> String {
        format!(
            "dpkg-query -W -f '${{db:Status-Status}} ${{Package}} ${{Version}}\\n' {}",
            shell_arg(&self.name)
        )
    }

    fn parse_query(&self, output: &str) -> Result<State, ResourceError> {
        let line = package::single_line(&self.label(), output)?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [status, ..] if *status != "installed" => Ok(State::Empty),
            [_, name, full_version] => {
                let (version, release) = split_deb_version(full_version);
                Ok(State::Package(PackageState::new(
                    *name,
                    Some(&version),
                    release.as_deref(),
                )))
            }
            _ => Err(ResourceError::malformed(
                self.label(),
                format!("expected 'STATUS PACKAGE VERSION', got '{}'", line),
                output,
            )),
        }
    }
}

#[async_trait]
impl Converge for Deb {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Deb
    }

    fn label(&self) -> String {
        format!("deb:{}", self.pin())
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
            Err(e) if !e.is_cancellation() && e.output().contains("no packages found matching") => {
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
        let Some(transition) = package::transition(diff.current(), &self.desired(), compare_deb)
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
            self.pin()
        };
        let cmd = format!("{} remove -y {}", APT, shell_arg(&target));
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
    use crate::transport::fake::FakeRunner;

    fn kubelet() -> Deb {
        Deb::new("kubelet", Some("1.14.1"), Some("00")).unwrap()
    }

    async fn observe_and_apply(deb: &Deb, runner: &FakeRunner) -> bool {
        let ctx = Context::background();
        let current = deb.query_state(&ctx, runner).await.unwrap();
        let diff = Diff::new(deb.state(), current);
        deb.apply(&ctx, runner, &diff).await.unwrap()
    }

    fn applied(runner: &FakeRunner) -> Vec<String> {
        runner
            .commands()
            .into_iter()
            .filter(|c| !c.starts_with("dpkg-query"))
            .collect()
    }

    #[test]
    fn test_nr024_pin_and_label() {
        assert_eq!(kubelet().pin(), "kubelet=1.14.1-00");
        assert_eq!(kubelet().label(), "deb:kubelet=1.14.1-00");
        assert_eq!(Deb::new("curl", None, None).unwrap().pin(), "curl");
        assert!(Deb::new("curl", None, Some("1")).is_err());

        let upstream_only = Deb::new("kubelet", Some("1.14.1"), None).unwrap();
        assert_eq!(upstream_only.pin(), "kubelet=1.14.1-*");
        assert_eq!(
            upstream_only.command_for(Transition::Install),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y 'kubelet=1.14.1-*'"
        );
    }

    #[tokio::test]
    async fn test_nr024_upstream_only_label_installs_and_undoes_with_glob() {
        let deb = Deb::new("kubelet", Some("1.14.1"), None).unwrap();
        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "installed kubelet 1.14.1-00\n");
        assert!(!observe_and_apply(&deb, &runner).await);
        assert!(applied(&runner).is_empty());

        let runner = FakeRunner::new();
        deb.undo(&Context::background(), &runner, &State::Empty)
            .await
            .unwrap();
        assert_eq!(
            runner.commands(),
            vec!["DEBIAN_FRONTEND=noninteractive apt-get remove -y 'kubelet=1.14.1-*'"]
        );
    }

    #[tokio::test]
    async fn test_nr024_no_packages_found_is_empty() {
        let runner = FakeRunner::new();
        runner.fail(
            "dpkg-query",
            1,
            "dpkg-query: no packages found matching kubelet\n",
        );
        let state = kubelet()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_nr024_removed_but_configured_is_empty() {
        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "config-files kubelet 1.13.0-00\n");
        let state = kubelet()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_nr024_query_splits_revision() {
        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "installed kubelet 1.14.1-00\n");
        let state = kubelet()
            .query_state(&Context::background(), &runner)
            .await
            .unwrap();
        assert_eq!(
            state,
            State::Package(PackageState::new("kubelet", Some("1.14.1"), Some("00")))
        );
        assert!(!kubelet().is_different(&state));
    }

    #[tokio::test]
    async fn test_nr024_install_upgrade_downgrade() {
        let runner = FakeRunner::new();
        runner.fail("dpkg-query", 1, "dpkg-query: no packages found matching kubelet\n");
        assert!(observe_and_apply(&kubelet(), &runner).await);
        assert_eq!(
            applied(&runner),
            vec!["DEBIAN_FRONTEND=noninteractive apt-get install -y kubelet=1.14.1-00"]
        );

        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "installed kubelet 1.13.5-00\n");
        assert!(observe_and_apply(&kubelet(), &runner).await);
        assert_eq!(
            applied(&runner),
            vec!["DEBIAN_FRONTEND=noninteractive apt-get install -y --only-upgrade kubelet=1.14.1-00"]
        );

        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "installed kubelet 1:1.0-1\n");
        assert!(observe_and_apply(&kubelet(), &runner).await);
        assert_eq!(
            applied(&runner),
            vec![
                "DEBIAN_FRONTEND=noninteractive apt-get remove -y kubelet && \
                 DEBIAN_FRONTEND=noninteractive apt-get install -y kubelet=1.14.1-00"
            ]
        );
    }

    #[tokio::test]
    async fn test_nr024_tilde_prerelease_upgrades() {
        let runner = FakeRunner::new();
        runner.respond("dpkg-query", "installed kubelet 1.14.1~rc1-00\n");
        assert!(observe_and_apply(&kubelet(), &runner).await);
        assert!(applied(&runner)[0].contains("--only-upgrade"));
    }

    #[test]
    fn test_nr024_allow_held() {
        let deb = kubelet().allow_held();
        assert_eq!(
            deb.command_for(Transition::Install),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y \
             --allow-change-held-packages kubelet=1.14.1-00"
        );
    }

    #[tokio::test]
    async fn test_nr024_undo_pin_by_default() {
        let runner = FakeRunner::new();
        kubelet()
            .undo(&Context::background(), &runner, &State::Empty)
            .await
            .unwrap();
        assert_eq!(
            runner.commands(),
            vec!["DEBIAN_FRONTEND=noninteractive apt-get remove -y kubelet=1.14.1-00"]
        );
    }

    #[test]
    fn test_nr024_from_fields() {
        let yaml = "name: kubeadm\nversion: \"1:1.14.1\"\nrelease: \"00\"\nallow_held: true\n";
        let deb = Deb::from_fields(serde_yaml_ng::from_str(yaml).unwrap()).unwrap();
        assert_eq!(deb.pin(), "kubeadm=1:1.14.1-00");
    }
}
