//! Suite configuration: command-line flags with environment fallbacks, and
//! the service catalog derived from them.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use supervisor::{CommandSpec, HealthCheck, OrchestratorConfig, ServiceSpec};

/// Directory under the suite root holding runtime state.
const STATE_DIR: &str = ".workflow-suite";

#[derive(Debug, Clone, Args)]
pub struct SuiteConfig {
    /// Host the workflow backend binds to.
    #[arg(long, env = "API_HOST", default_value = "127.0.0.1", global = true)]
    pub api_host: String,

    #[arg(long, env = "API_PORT", default_value_t = 8000, global = true)]
    pub api_port: u16,

    /// Host the browser web UI binds to.
    #[arg(long, env = "WEBUI_HOST", default_value = "127.0.0.1", global = true)]
    pub webui_host: String,

    #[arg(long, env = "WEBUI_PORT", default_value_t = 7788, global = true)]
    pub webui_port: u16,

    /// Port of the frontend dev server.
    #[arg(long, env = "UI_PORT", default_value_t = 5173, global = true)]
    pub ui_port: u16,

    /// Python interpreter used for the backend and the web UI.
    #[arg(long, env = "SUITE_PYTHON", default_value = "python3", global = true)]
    pub python: String,

    /// Directory containing `workflows/`, `browser-use-web-ui/` and `ui/`.
    #[arg(long, env = "SUITE_ROOT", default_value = ".", global = true)]
    pub root: PathBuf,

    /// Pause between starting consecutive services.
    #[arg(long, default_value_t = 3, global = true)]
    pub settle_delay_secs: u64,

    /// Time each service gets to exit after SIGTERM before it is killed.
    #[arg(long, default_value_t = 5, global = true)]
    pub grace_secs: u64,
}

impl SuiteConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            grace_period: self.grace_period(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_DIR).join("state.json")
    }

    /// backend, webui, ui: the order the full suite starts in.
    pub fn webui_url(&self) -> String {
        format!("http://{}:{}", self.webui_host, self.webui_port)
    }

    pub fn catalog(&self) -> Vec<ServiceSpec> {
        let backend = ServiceSpec::new(
            "backend",
            CommandSpec::new(&self.python)
                .args(["-m", "backend.api", "--host", self.api_host.as_str()])
                .arg("--port")
                .arg(self.api_port.to_string())
                .current_dir(self.root.join("workflows")),
        )
        .with_health(HealthCheck::http(
            format!("http://{}:{}/health", self.api_host, self.api_port),
            Duration::from_secs(30),
        ))
        .critical(true);

        let webui = ServiceSpec::new(
            "webui",
            CommandSpec::new(&self.python)
                .args(["webui.py", "--ip", self.webui_host.as_str()])
                .arg("--port")
                .arg(self.webui_port.to_string())
                .current_dir(self.root.join("browser-use-web-ui")),
        )
        .with_health(HealthCheck::http(self.webui_url(), Duration::from_secs(60)));

        let ui = ServiceSpec::new(
            "ui",
            CommandSpec::new("npm")
                .args(["run", "dev"])
                .current_dir(self.root.join("ui")),
        )
        .with_health(HealthCheck::http(
            format!("http://127.0.0.1:{}", self.ui_port),
            Duration::from_secs(30),
        ));

        vec![backend, webui, ui]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use supervisor::ProbeTarget;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: SuiteConfig,
    }

    fn parse(args: &[&str]) -> SuiteConfig {
        let argv = std::iter::once("workflow-suite").chain(args.iter().copied());
        Harness::try_parse_from(argv).unwrap().config
    }

    fn url(spec: &ServiceSpec) -> String {
        match &spec.health.as_ref().unwrap().target {
            ProbeTarget::Http { url } => url.clone(),
            other => panic!("unexpected target {other}"),
        }
    }

    #[test]
    fn catalog_is_backend_webui_ui() {
        let config = parse(&["--root", "/srv/suite"]);
        let catalog = config.catalog();

        let names: Vec<_> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["backend", "webui", "ui"]);

        let critical: Vec<_> = catalog.iter().map(|s| s.critical).collect();
        assert_eq!(critical, [true, false, false]);
    }

    #[test]
    fn flags_flow_into_commands_and_health_urls() {
        let config = parse(&[
            "--root", "/srv/suite",
            "--api-host", "0.0.0.0",
            "--api-port", "9000",
            "--webui-port", "8800",
            "--python", "/opt/py/bin/python",
        ]);
        let catalog = config.catalog();
        let backend = &catalog[0];

        assert_eq!(backend.command.program, "/opt/py/bin/python");
        assert_eq!(
            backend.command.args,
            ["-m", "backend.api", "--host", "0.0.0.0", "--port", "9000"]
        );
        assert_eq!(backend.command.working_dir, Some(PathBuf::from("/srv/suite/workflows")));
        assert_eq!(url(backend), "http://0.0.0.0:9000/health");
        assert_eq!(backend.health.as_ref().unwrap().timeout, Duration::from_secs(30));

        assert_eq!(url(&catalog[1]), "http://127.0.0.1:8800");
        assert_eq!(catalog[1].health.as_ref().unwrap().timeout, Duration::from_secs(60));
        assert_eq!(url(&catalog[2]), "http://127.0.0.1:5173");
        assert_eq!(catalog[2].command.program, "npm");
    }

    #[test]
    fn state_file_lives_under_root() {
        let config = parse(&["--root", "/srv/suite"]);
        assert_eq!(config.state_path(), PathBuf::from("/srv/suite/.workflow-suite/state.json"));
    }

    #[test]
    fn timing_flags_reach_orchestrator_config() {
        let config = parse(&["--settle-delay-secs", "1", "--grace-secs", "9"]);
        let orch = config.orchestrator_config();

        assert_eq!(orch.settle_delay, Duration::from_secs(1));
        assert_eq!(orch.grace_period, Duration::from_secs(9));
        assert_eq!(orch.probe_attempt_timeout, Duration::from_secs(2));
    }
}
