use clap::Parser;

fn parse_overprovisioning(input: &str) -> Result<f64, String> {
    let factor: f64 = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid overprovisioning factor: {input:?}"))?;
    if !factor.is_finite() || factor < 1.0 {
        return Err(format!(
            "overprovisioning factor must be >= 1.0, got {input:?}"
        ));
    }
    Ok(factor)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "meister", version, about = "Job scheduler for the CRS worker fleet")]
pub struct Cli {
    /// Control-plane host; unset (or empty) runs the offline priority
    /// backfill instead of scheduling pods.
    #[arg(long, env = "KUBERNETES_SERVICE_HOST")]
    pub kubernetes_host: Option<String>,

    #[arg(long, env = "KUBERNETES_SERVICE_PORT", default_value_t = 443)]
    pub kubernetes_port: u16,

    /// Bound on creator fan-out and pod-classification parallelism.
    #[arg(long, env = "MEISTER_NUM_THREADS", default_value_t = 20)]
    pub num_threads: usize,

    /// Oversubscription factor applied to the available-resource vector.
    #[arg(long, env = "MEISTER_OVERPROVISIONING", value_parser = parse_overprovisioning)]
    pub overprovisioning: f64,

    /// Seconds to sleep between scheduler ticks.
    #[arg(long, env = "MEISTER_SLEEPYTIME", default_value_t = 3)]
    pub sleepytime: u64,

    /// Container image every worker pod runs.
    #[arg(long, env = "WORKER_IMAGE")]
    pub worker_image: String,

    #[arg(long, env = "WORKER_IMAGE_PULL_POLICY")]
    pub worker_image_pull_policy: String,

    #[arg(long, env = "POSTGRES_DATABASE_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_DATABASE_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE_USER")]
    pub postgres_user: String,

    #[arg(long, env = "POSTGRES_DATABASE_PASSWORD", hide_env_values = true)]
    pub postgres_password: String,

    #[arg(long, env = "POSTGRES_DATABASE_NAME")]
    pub postgres_database: String,

    /// Presence forwards the read-slave flag to worker pods.
    #[arg(long, env = "POSTGRES_USE_SLAVES")]
    pub postgres_use_slaves: Option<String>,
}

impl Cli {
    /// The cluster host, if one is configured. An empty value counts as
    /// absent, matching how the orchestrator exposes the variable.
    pub fn cluster_host(&self) -> Option<String> {
        self.kubernetes_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, parse_overprovisioning};
    use clap::Parser;

    fn base_args() -> Vec<&'static str> {
        vec![
            "meister",
            "--overprovisioning",
            "1.5",
            "--worker-image",
            "registry.invalid/worker:latest",
            "--worker-image-pull-policy",
            "IfNotPresent",
            "--postgres-user",
            "worker",
            "--postgres-password",
            "secret",
            "--postgres-database",
            "crs",
        ]
    }

    #[test]
    fn overprovisioning_must_be_at_least_one() {
        assert!(parse_overprovisioning("1.0").is_ok());
        assert!(parse_overprovisioning("2.5").is_ok());
        assert!(parse_overprovisioning("0.9").is_err());
        assert!(parse_overprovisioning("NaN").is_err());
        assert!(parse_overprovisioning("plenty").is_err());
    }

    #[test]
    fn empty_cluster_host_selects_offline_mode() {
        let cli = Cli::parse_from(base_args());
        assert_eq!(cli.cluster_host(), None);

        let mut args = base_args();
        args.extend(["--kubernetes-host", ""]);
        let cli = Cli::parse_from(args);
        assert_eq!(cli.cluster_host(), None);

        let mut args = base_args();
        args.extend(["--kubernetes-host", "10.0.0.1"]);
        let cli = Cli::parse_from(args);
        assert_eq!(cli.cluster_host(), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn missing_required_settings_fail_at_startup() {
        let err = Cli::try_parse_from(["meister"]);
        assert!(err.is_err());
    }
}
