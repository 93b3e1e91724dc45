use anyhow::{Context, Result};
use estimator_client::{
    comms,
    driver::{self, Driver},
    ClientConfig, Prediction, Predictor,
};
use log::{info, warn};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    signal,
};
use tokio_util::sync::CancellationToken;

/// Reads one value per line from stdin, trains the estimator with it and asks
/// for a prediction of the next one.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cfg = ClientConfig::from_env()?;
    let (transport, inbound) = comms::connect(&cfg.addr)
        .await
        .with_context(|| format!("failed to connect to estimator at {}", cfg.addr))?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT");
        }
        token.cancel();
    });

    let mut driver = Driver::new(inbound, cfg.sweep_interval, cancel);
    let mut predictor = Predictor::new(transport, cfg.predictor, |res| match res {
        Ok(Prediction::Point(est)) => println!("{est}"),
        Ok(Prediction::Distribution(ests)) => println!("{ests:?}"),
        Err(e) => warn!("dropping prediction: {e}"),
    })
    .with_lot_timeout(cfg.lot_timeout);

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut reading = true;

    while reading || predictor.pending_lots() > 0 {
        tokio::select! {
            event = driver.next_event() => match event {
                Some(event) => driver::dispatch(&mut predictor, event),
                None => break,
            },
            line = lines.next_line(), if reading => match line? {
                Some(line) => step(&mut predictor, &line),
                None => {
                    let pending = predictor.pending_lots();
                    info!("input exhausted, waiting for {pending} pending request(s)");
                    reading = false;
                }
            },
        }
    }

    let abandoned = predictor.shutdown();
    if abandoned > 0 {
        warn!("{abandoned} request(s) never got a response");
    }

    info!("wrapping up, disconnecting...");
    Ok(())
}

fn step<T: comms::Transport>(predictor: &mut Predictor<T>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value = match line.parse::<u8>() {
        Ok(value) => value,
        Err(e) => {
            warn!("ignoring input {line:?}: {e}");
            return;
        }
    };

    if let Err(e) = predictor.observe(value) {
        warn!("{e}");
        return;
    }

    if let Err(e) = predictor.predict() {
        warn!("{e}");
    }
}
