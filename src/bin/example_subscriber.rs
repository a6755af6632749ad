use log::info;
use shm_broker::{Broker, BrokerConfig, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Prints everything addressed to "subscriber" plus the maintenance status
// events, until ctrl-c.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let broker = Broker::open(BrokerConfig::from_env())?;
    let router = Router::new(broker, "subscriber")?;
    let handler = router.register_handler("subscriber");
    {
        let mut handler = handler.lock();
        handler.add_pending_maintenance_events();
        handler.set_incoming_func(|event| {
            info!("{} from {}: {}", event.topic(), event.from(), event.payload_str());
        });
        handler.set_attach_process_func(|p| info!("process {} attached", p.id()));
        handler.set_detach_process_func(|p| info!("process {} detached", p.id()));
    }
    router.start(10)?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    router.stop()?;
    return Ok(());
}
