use ftpsource::protocols::RemoteLister;
use ftpsource::publisher::{source_prefix, CloudEventPublisher};
use ftpsource::scheduler::CycleOutcome;
use ftpsource::shutdown::{SIGNAL_INT, SIGNAL_TERM};
use ftpsource::*;
use std::process;

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        if let Err(e) = set_log_file(log_file) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }

    let _ = log(&format!("{} version {} starting", PROGRAM_NAME, PROGRAM_VERSION));

    let config = match parse_config(&args.config_file) {
        Ok(c) => c,
        Err(e) => {
            let _ = log(&format!("Error loading configuration: {}", e));
            process::exit(1);
        }
    };

    let protocol = config.protocol();
    let _ = log(&format!(
        "Watching {}://{}:{}{} every {}s, publishing to {}",
        protocol.scheme(),
        config.host,
        config.port(),
        config.dir,
        config.poll_interval_secs,
        config.sink
    ));

    let store = StateStore::new(
        FileRecordBackend::new(&config.store.path),
        &config.store.namespace,
        &config.store.name,
    )
    .with_init_policy(config.store_init_interval(), config.store_init_timeout());
    let _ = log(&format!(
        "Storing state in {} under {}",
        store.record_id(),
        config.store.path
    ));
    if let Err(e) = store.initialize() {
        let _ = log(&format!("Fatal: {}", e));
        process::exit(1);
    }

    let publisher = match CloudEventPublisher::new(
        &config.sink,
        &config.event_type,
        &source_prefix(protocol.scheme(), &config.host, config.port(), &config.dir),
        config.connect_timeout(),
    ) {
        Ok(p) => p,
        Err(e) => {
            let _ = log(&format!("Error creating event publisher: {}", e));
            process::exit(1);
        }
    };

    let mut scheduler = PollScheduler::new(
        RemoteLister::from_config(&config),
        publisher,
        WatermarkEngine::new(store, config.boundary_tracking),
        PollSettings::from(&config),
    );

    if args.once {
        let code = match scheduler.run_cycle() {
            CycleOutcome::Completed(report) if report.delivery_error.is_none() => 0,
            _ => 2,
        };
        let _ = log("Single poll cycle finished");
        process::exit(code);
    }

    let shutdown = ShutdownSignal::new();
    if let Err(e) = install_signal_handler(&shutdown) {
        let _ = log(&format!("Error setting signal handler: {}", e));
        process::exit(1);
    }

    let handle = match scheduler.start(shutdown.clone()) {
        Ok(h) => h,
        Err(e) => {
            let _ = log(&format!("Error starting poll scheduler: {}", e));
            process::exit(1);
        }
    };

    shutdown.wait();
    match shutdown.signal_type() {
        Some(SIGNAL_INT) => {
            let _ = log("Received SIGINT, waiting for the current poll cycle to finish");
        }
        Some(SIGNAL_TERM) => {
            let _ = log("Received SIGTERM, waiting for the current poll cycle to finish");
        }
        _ => {
            let _ = log("Shutdown requested, waiting for the current poll cycle to finish");
        }
    }
    handle.stop();

    let _ = log("Exiting");
}
