use clap::Parser;
use restream_core::{
    FfmpegCapture, OutputSession, SourceCapture, SourceDescriptor, Supervisor, encoder_available,
};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod select;

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("live_restream", level)
        .filter_module("restream_core", level)
        .parse_default_env()
        .init();
}

/// Picks the source (prompting when none was given) and connects to it.
/// `None` means the operator chose to exit.
fn connect_source(
    source: Option<SourceDescriptor>,
) -> anyhow::Result<Option<(FfmpegCapture, SourceDescriptor)>> {
    let mut capture = FfmpegCapture::new();
    let source = match source {
        Some(source) => source,
        None => {
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            match select::prompt_source(&mut capture, &mut stdin.lock(), &mut stdout)? {
                select::Selection::Source(source) => source,
                select::Selection::Exit => return Ok(None),
            }
        }
    };
    capture.connect(&source)?;
    Ok(Some((capture, source)))
}

#[tokio::main]
async fn main() -> ! {
    let cli = config::Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = restream_core::init() {
        log::error!("{}", e);
        std::process::exit(1);
    }
    restream_core::set_backend_log_level(cli.verbose);

    let config = cli.streamer_config().unwrap_or_else(|e| {
        log::error!("{}", e);
        std::process::exit(1);
    });
    for name in [&config.video_encoder, &config.audio_encoder] {
        if !encoder_available(name) {
            log::error!("encoder not available: {}", name);
            std::process::exit(1);
        }
    }

    let source = cli.source();
    let (capture, source) = match tokio::task::spawn_blocking(move || connect_source(source)).await
    {
        Ok(Ok(Some(connected))) => connected,
        Ok(Ok(None)) => std::process::exit(0),
        Ok(Err(e)) => {
            log::error!("capture unavailable: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("capture setup panicked: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(&config, capture, OutputSession::new(), cancel.clone())
        .with_source(source);
    if let Some(addr) = cli.status_listen.clone() {
        api::start_status_server(addr, supervisor.subscribe(), cancel.clone());
    }

    log::info!(
        "streaming to {} ({})",
        config.destination,
        config.container.muxer_name()
    );
    let mut handle = tokio::task::spawn_blocking(move || supervisor.run());

    let code = loop {
        tokio::select! {
            result = &mut handle => {
                break match result {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        log::error!("{}", e);
                        1
                    }
                    Err(e) => {
                        log::error!("supervisor panicked: {}", e);
                        1
                    }
                };
            },
            _ = tokio::signal::ctrl_c() => {
                if !cancel.is_cancelled() {
                    log::info!("interrupt received, stopping");
                }
                cancel.cancel();
            },
        }
    };
    cancel.cancel();

    std::process::exit(code);
}
