//! mesh simulation for TacMesh

use std::time::Duration;
use anyhow::Result;
use colored::Colorize;

use tacmesh_core::DataType;
use tacmesh_radio::{MediumConfig, RadioConfig};
use tacmesh_sim::scenarios::{self, ScenarioReport};
use tacmesh_sim::{SimNetwork, SimulationPresets, Topology};

const NODES: u8 = 4;

fn print_report(report: &ScenarioReport) {
    let ratio = report.delivery_ratio() * 100.0;
    let line = format!(
        "  {:<24} offered {:>3}  queued {:>3}  sent {:>3}  delivered {:>3} ({:.0}%)  in {:?}",
        report.name, report.offered, report.queued, report.sent, report.delivered, ratio, report.elapsed
    );
    if ratio >= 90.0 {
        println!("{}", line.green());
    } else if ratio >= 50.0 {
        println!("{}", line.yellow());
    } else {
        println!("{}", line.red());
    }
    let mut drops: Vec<_> = report.drops.iter().collect();
    drops.sort_by_key(|(reason, _)| reason.to_string());
    for (reason, count) in drops {
        println!("    dropped {}: {}", reason, count);
    }
}

async fn run_preset(name: &str, medium: MediumConfig, template: &RadioConfig) -> Result<()> {
    println!("{}", format!("\n>>> {}", name).bright_green().bold());
    println!(
        "Link: rssi {} dBm, snr {} dB, loss {:.0}%, jitter {} dB",
        medium.default_link.rssi,
        medium.default_link.snr,
        medium.default_link.loss * 100.0,
        medium.signal_jitter_db
    );

    let mut mesh = SimNetwork::build(NODES, Topology::FullMesh, medium.clone(), template).await;
    match mesh.wait_for_neighbours(NODES as usize - 1, Duration::from_secs(30)).await {
        Ok(took) => println!("Full mesh formed in {:?}", took),
        Err(e) => println!("{}", format!("Full mesh incomplete: {}", e).yellow()),
    }
    let sms = scenarios::unicast_exchange(
        &mut mesh,
        1,
        NODES,
        20,
        DataType::Sms,
        Duration::from_millis(100),
        Duration::from_secs(20),
    )
    .await?;
    print_report(&sms);
    let voice = scenarios::unicast_exchange(
        &mut mesh,
        2,
        3,
        10,
        DataType::Voice,
        Duration::from_millis(100),
        Duration::from_secs(10),
    )
    .await?;
    print_report(&voice);
    match scenarios::ptt_talk_spurt(&mut mesh, 3, 10).await {
        Ok(report) => print_report(&report),
        Err(e) => println!("{}", format!("  PTT failed: {}", e).red()),
    }
    let (bursts, deliveries, lost, bytes) = mesh.medium.get_stats().await;
    println!("Air: {} bursts, {} deliveries, {} lost, {} bytes", bursts, deliveries, lost, bytes);
    mesh.shutdown();

    let mut line = SimNetwork::build(3, Topology::Line, medium, template).await;
    if line.wait_for_neighbours(1, Duration::from_secs(30)).await.is_ok() {
        tokio::time::sleep(Duration::from_secs(8)).await;
    }
    let relay = scenarios::unicast_exchange(
        &mut line,
        1,
        3,
        10,
        DataType::Sms,
        Duration::from_millis(200),
        Duration::from_secs(20),
    )
    .await?;
    print_report(&relay);
    if let Some(middle) = line.node(2) {
        println!("Relayed by node 2: {}", middle.rrc_stats().relayed);
    }
    line.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "TacMesh Mesh Simulation".bright_blue().bold());
    println!("{}", "=======================".bright_blue());

    let template = RadioConfig::data(1);
    let presets = vec![
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];
    for (name, medium) in presets {
        run_preset(name, medium, &template).await?;
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Extreme Conditions (deep fade)".bright_red().bold());
    run_preset("Extreme Conditions", SimulationPresets::extreme_conditions(), &template).await?;

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
