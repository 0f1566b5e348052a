use venus_energy_manager::prelude::*;

#[tokio::main]
async fn main() {
    if let Err(err) = venus_energy_manager::run(Options::new()).await {
        error!("{:#}", err);
        eprintln!("venus-energy-manager: {:#}", err);
        std::process::exit(255);
    }
}
