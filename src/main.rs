use media::{session::Session, types::SessionConfig};

mod config;
mod media;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::config();
    log::debug!("config: {:?}", config);

    let session = Session::new(SessionConfig::from(config));
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted, stopping");
            cancel.cancel();
        }
    });

    let report = session.run().await?;
    println!("{}", report);
    Ok(())
}
