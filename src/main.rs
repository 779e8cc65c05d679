use archivist::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.archive.thread_pool_size)
        .enable_all()
        .build()?;

    runtime.block_on(archivist::run(config))
}
