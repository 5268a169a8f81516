fn help() {
    const HELP: &str = r#"
        EC2_SENSOR_BASE_URL=https://api EC2_SENSOR_API_KEY=key \
            cargo run --features env-config --example fleet-status -- [--watch SECONDS] [--metrics]
    "#;
    println!("{HELP}");
}

fn print_fleet(rows: &[sensor_fleet::fleet::HostView]) {
    println!("{:<48} {:<10} {:<16} {:<10} AGE", "HOST", "STATUS", "ADDRESS", "VERSION");
    for row in rows {
        let age = row
            .age
            .map_or_else(|| "no data".to_string(), |a| format!("{}s", a.as_secs()));
        println!(
            "{:<48} {:<10} {:<16} {:<10} {}{}",
            row.id,
            row.status,
            row.address.as_deref().unwrap_or("-"),
            row.version.as_deref().unwrap_or("-"),
            age,
            if row.stale { " (stale)" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut watch = None;
    let mut metrics = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--watch" => {
                let Some(secs) = args.next().and_then(|s| s.parse::<u64>().ok()) else {
                    help();
                    return Ok(());
                };
                watch = Some(std::time::Duration::from_secs(secs));
            }
            "--metrics" => metrics = true,
            _ => {
                help();
                return Ok(());
            }
        }
    }

    let config = sensor_fleet::env_config::from_env()?;
    let fleet = sensor_fleet::Fleet::builder(config).build().await?;

    let result = run(&fleet, watch, metrics).await;
    fleet.shutdown().await;
    result
}

async fn run(
    fleet: &sensor_fleet::Fleet,
    watch: Option<std::time::Duration>,
    metrics: bool,
) -> anyhow::Result<()> {
    loop {
        let report = fleet.refresh_stale().await?;
        for host_id in report.deleted() {
            println!("{host_id} no longer exists, dropped from the host list");
        }
        if !fleet.health().is_online() {
            println!(
                "OFFLINE, showing cached data: {}",
                fleet.health().last_error().unwrap_or_default()
            );
        }
        print_fleet(&fleet.hosts().await);

        if metrics {
            println!();
            for (host_id, entry) in fleet.collect_metrics().await {
                println!(
                    "{host_id}: cpu {} mem {} disk {} services {}",
                    entry.cpu(),
                    entry.memory(),
                    entry.disk(),
                    entry.services()
                );
            }
        }

        let stats = fleet.stats().snapshot();
        println!(
            "\n{} API calls, {} ms average, {} refreshes",
            stats.api_calls, stats.average_latency_ms, stats.refreshes
        );

        let Some(period) = watch else {
            return Ok(());
        };
        tokio::time::sleep(period).await;
        println!();
    }
}
