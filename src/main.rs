//! lamlet-emu: functional model of the lamlet dispatch core

use std::env;
use std::path::Path;

use lamlet_emu::emu::MeshEngine;
use lamlet_emu::packet::{Dest, Kinstr};
use lamlet_emu::params::LamletParams;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut kinstrs: u64 = 64;
    let mut broadcast = false;
    let mut max_cycles: u64 = 1_000_000;
    let mut config_path = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--kinstrs" | "-n" => {
                let value = iter.next().ok_or_else(|| anyhow::anyhow!("--kinstrs needs a count"))?;
                kinstrs = value.parse()?;
            }
            "--broadcast" | "-b" => broadcast = true,
            "--max-cycles" => {
                let value =
                    iter.next().ok_or_else(|| anyhow::anyhow!("--max-cycles needs a count"))?;
                max_cycles = value.parse()?;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if !other.starts_with('-') => config_path = Some(other.to_string()),
            other => anyhow::bail!("unknown option: {}", other),
        }
    }

    let params = match &config_path {
        Some(path) => {
            println!("Loading: {}", path);
            LamletParams::load(Path::new(path))?
        }
        None => LamletParams::default(),
    };

    let mut engine = MeshEngine::new(&params);
    let kamlets = params.k_in_l();

    // Synthetic workload: either broadcasts or kinstrs round-robined over
    // the kamlets.
    for i in 0..kinstrs {
        let dest = if broadcast {
            Dest::Broadcast
        } else {
            Dest::Kamlet((i % kamlets as u64) as u8)
        };
        engine.push_kinstr(Kinstr::compute(i, dest));
    }

    let idle = engine.run_until_idle(max_cycles)?;
    let stats = engine.stats();

    println!();
    println!("Run Summary");
    println!("===========");
    println!("Grid: {}x{} kamlets, {} idents", params.k_cols, params.k_rows, params.max_idents);
    println!("Cycles:              {}", stats.cycles);
    println!("Kinstrs dispatched:  {}", stats.dispatch.kinstrs);
    println!("Kinstrs retired:     {}", stats.retired);
    println!("Packets framed:      {}", stats.dispatch.packets);
    println!("Words on channel:    {}", stats.dispatch.words);
    println!("Reclamation rounds:  {}", stats.rounds);
    println!("Idents available:    {}", engine.available_idents());

    if !idle {
        anyhow::bail!("mesh not idle after {} cycles", max_cycles);
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: lamlet-emu [config.toml] [options]");
    println!();
    println!("Options:");
    println!("  -n, --kinstrs <N>    number of kinstrs to dispatch (default 64)");
    println!("  -b, --broadcast      send every kinstr to all kamlets");
    println!("      --max-cycles <N> give up after N cycles (default 1000000)");
}
