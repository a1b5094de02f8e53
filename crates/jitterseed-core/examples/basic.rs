//! Basic seed generation example.
//!
//! Probes the noise sources on this machine, draws a seed through the
//! supervisor-backed provider and prints it as hex.
//!
//! Run: `RUST_LOG=info cargo run --example basic`

use jitterseed_core::{Config, Error, Nrbg, SourceFactory, SourceProvider};

fn main() -> Result<(), Error> {
    env_logger::init();

    let config = Config::from_env()?;
    for desc in SourceFactory::new(config.clone()).descriptors() {
        println!(
            "{:<8} available={:<5} fips={}",
            desc.name, desc.available, desc.fips_eligible
        );
    }

    let mut nrbg = Nrbg::new(config)?;
    let seed = match nrbg.generate_seed(48) {
        Err(Error::RestartAdvisory(to)) => {
            println!("failed over to {to}");
            nrbg.generate_seed(48)?
        }
        other => other?,
    };

    print!("Seed (hex): ");
    for b in &seed {
        print!("{b:02x}");
    }
    println!();

    if let Some(report) = nrbg.health_report() {
        println!(
            "\n{}: {} blocks accepted, {} rejected, {} bytes out",
            report.source, report.blocks_accepted, report.blocks_rejected, report.stats.bytes_generated
        );
    }
    Ok(())
}
