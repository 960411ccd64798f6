/// Smoke test for `ChromiumDriver`.
///
/// Launches a two-worker cluster on headless Chromium, visits a couple of
/// pages and checks their titles.
///
/// Run with:
///   cargo run --example cluster_smoke --features browser
use corral_chromium::{ChromiumDriver, Page};
use corral_core::{Cluster, ClusterOptions, Concurrency, TaskArgs, task};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let options = ClusterOptions::default()
        .with_concurrency(Concurrency::Context)
        .with_max_concurrency(2);
    let cluster: Cluster<String, String, Page> =
        Cluster::launch(ChromiumDriver::new(), options).await?;

    cluster.task(task(|args: TaskArgs<String, Page>| async move {
        let url = args.data.unwrap_or_default();
        args.page.goto(url).await?;
        let title = args.page.get_title().await?.unwrap_or_default();
        Ok(title)
    }));

    let (first, second) = tokio::join!(
        cluster.execute("https://example.com".to_string()),
        cluster.execute("https://example.org".to_string()),
    );
    let first = first?;
    let second = second?;
    assert!(first.contains("Example Domain"), "unexpected title: {first}");
    assert!(second.contains("Example Domain"), "unexpected title: {second}");

    println!("{}", summary(&cluster));
    cluster.close().await;
    println!("OK");
    Ok(())
}

fn summary(cluster: &Cluster<String, String, Page>) -> String {
    let status = cluster.status();
    format!(
        "done {} / {} in {} ({} errors)",
        status.done_targets, status.all_target_count, status.time_running, status.error_count
    )
}
