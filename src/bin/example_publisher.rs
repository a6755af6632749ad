use log::info;
use shm_broker::{Broker, BrokerConfig, EventKind, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Sends a "hello" to the subscriber once a second until ctrl-c.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = BrokerConfig::from_env();
    let ttl = config.default_event_ttl;
    let broker = Broker::open(config)?;
    let router = Router::new(broker, "publisher")?;
    router.start(5)?;

    let mut count: u64 = 0;
    while running.load(Ordering::SeqCst) {
        count += 1;
        let outcome = router.send(
            "hello",
            "subscriber",
            router.id(),
            EventKind::Generic,
            ttl,
            &format!("hello {}", count),
        );
        info!("sent hello {} as event {}", count, outcome.key());
        std::thread::sleep(Duration::from_secs(1));
    }

    router.stop()?;
    return Ok(());
}
