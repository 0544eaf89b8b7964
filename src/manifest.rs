//! Declarative service definitions for the hosting platforms.
//!
//! Both formats are derived from the same `RuntimeConfig` and
//! `HealthCheckSpec` the orchestrator runs with, so the port, environment
//! and health check a platform sees cannot drift from what the backend is
//! started with. Output is JSON, which every YAML loader also accepts.

use crate::config::{Hosting, RuntimeConfig};
use crate::health::HealthCheckSpec;
use crate::pipeline::Profile;
use serde_json::{json, Value};
use std::time::Duration;

/// Manifest flavours `stagehand manifest` can print
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ManifestFormat {
    /// docker compose service
    Compose,
    /// render.yaml-style managed platform blueprint
    Render,
    /// nginx server block for the reverse proxy
    Nginx,
}

/// Everything a service definition is derived from
#[derive(Debug, Clone)]
pub struct ServiceDefinition<'a> {
    pub name: &'a str,
    pub profile: Profile,
    pub hosting: Hosting,
    pub runtime: &'a RuntimeConfig,
    pub health: &'a HealthCheckSpec,
}

impl ServiceDefinition<'_> {
    /// Environment the platform must set, in contract order
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("PORT", self.runtime.port.to_string()),
            ("HOST", self.runtime.host.clone()),
            ("WORKERS", self.runtime.worker_count.to_string()),
            ("TIMEOUT", self.runtime.request_timeout_secs.to_string()),
        ];
        if let Some(max) = self.runtime.max_requests_per_worker {
            vars.push(("MAX_REQUESTS", max.to_string()));
        }
        vars
    }

    /// Container entry command: the orchestrator itself
    pub fn start_command(&self) -> Vec<String> {
        vec![
            "stagehand".to_string(),
            "run".to_string(),
            "--profile".to_string(),
            self.profile.as_str().to_string(),
            "--hosting".to_string(),
            self.hosting.as_str().to_string(),
        ]
    }

    pub fn compose(&self) -> Value {
        let environment: serde_json::Map<String, Value> = self
            .env_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect();

        json!({
            "services": {
                self.name: {
                    "build": ".",
                    "command": self.start_command(),
                    "ports": [format!("{0}:{0}", self.runtime.port)],
                    "environment": environment,
                    "healthcheck": {
                        "test": ["CMD", "stagehand", "probe"],
                        "interval": duration_str(self.health.interval),
                        "timeout": duration_str(self.health.timeout),
                        "retries": self.health.retries,
                        "start_period": duration_str(self.health.start_period),
                    },
                    "restart": "unless-stopped",
                }
            }
        })
    }

    pub fn render(&self) -> Value {
        let env_vars: Vec<Value> = self
            .env_vars()
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();

        let plan = match self.hosting {
            Hosting::Constrained => "free",
            Hosting::Container => "standard",
        };

        json!({
            "services": [{
                "type": "web",
                "name": self.name,
                "runtime": "docker",
                "plan": plan,
                "dockerCommand": shell_words::join(self.start_command()),
                "healthCheckPath": self.health.path,
                "envVars": env_vars,
            }]
        })
    }
}

/// Compose-style duration (`30s`, `1m30s`)
fn duration_str(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 60, secs % 60) {
        (0, s) => format!("{}s", s),
        (m, 0) => format!("{}m", m),
        (m, s) => format!("{}m{}s", m, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMap;

    fn definition<'a>(
        runtime: &'a RuntimeConfig,
        health: &'a HealthCheckSpec,
        hosting: Hosting,
    ) -> ServiceDefinition<'a> {
        ServiceDefinition {
            name: "web",
            profile: Profile::FullStack,
            hosting,
            runtime,
            health,
        }
    }

    #[test]
    fn test_duration_str() {
        assert_eq!(duration_str(Duration::from_secs(10)), "10s");
        assert_eq!(duration_str(Duration::from_secs(120)), "2m");
        assert_eq!(duration_str(Duration::from_secs(90)), "1m30s");
    }

    #[test]
    fn test_compose_matches_runtime_config() {
        let runtime = RuntimeConfig::defaults(Hosting::Container);
        let health = HealthCheckSpec::default();
        let compose = definition(&runtime, &health, Hosting::Container).compose();
        let service = &compose["services"]["web"];

        assert_eq!(service["ports"][0], "8000:8000");
        assert_eq!(service["environment"]["WORKERS"], "4");
        assert!(service["environment"].get("MAX_REQUESTS").is_none());
        assert_eq!(
            service["healthcheck"]["test"],
            json!(["CMD", "stagehand", "probe"])
        );
        assert_eq!(service["healthcheck"]["interval"], "30s");
        assert_eq!(service["healthcheck"]["timeout"], "10s");
        assert_eq!(service["healthcheck"]["retries"], 3);
        assert_eq!(service["healthcheck"]["start_period"], "40s");
        assert_eq!(
            service["command"],
            json!(["stagehand", "run", "--profile", "full-stack", "--hosting", "container"])
        );
    }

    #[test]
    fn test_render_constrained() {
        let runtime = RuntimeConfig::defaults(Hosting::Constrained);
        let health = HealthCheckSpec::default();
        let render = definition(&runtime, &health, Hosting::Constrained).render();
        let service = &render["services"][0];

        assert_eq!(service["plan"], "free");
        assert_eq!(service["healthCheckPath"], "/health");
        assert_eq!(
            service["dockerCommand"],
            "stagehand run --profile full-stack --hosting constrained"
        );
        let keys: Vec<&str> = service["envVars"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["key"].as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["PORT", "HOST", "WORKERS", "TIMEOUT", "MAX_REQUESTS"]);
    }

    #[test]
    fn test_env_vars_resolve_back_to_same_config() {
        for hosting in [Hosting::Constrained, Hosting::Container] {
            let mut runtime = RuntimeConfig::defaults(hosting);
            runtime.port = 9000;
            let health = HealthCheckSpec::default();
            let env: EnvMap = definition(&runtime, &health, hosting)
                .env_vars()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();

            assert_eq!(RuntimeConfig::from_env(&env, hosting).unwrap(), runtime);
        }
    }
}
