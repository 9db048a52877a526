use std::path::Path;

use anyhow::Context;
use comet_keeper_ledger::AccountSet;

use super::load_config;

/// Validates configuration and prints the derived accounts.
pub fn check_config(path: &Path, profile: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(path, profile)?;
    let programs = config.program_ids().context("Invalid program ids")?;
    let accounts = AccountSet::derive(programs);

    println!("config:             {}", path.display());
    println!("rpc:                {}", config.ledger.rpc_url);
    println!("owner:              {}", programs.manager_owner);
    println!("manager account:    {}", accounts.manager_info);
    println!("position account:   {}", accounts.position);
    println!("target health:      {}", config.manager.target_health_score);
    println!("rebalance threshold: {}", config.manager.rebalance_threshold);
    println!("max redemptions:    {}", config.manager.max_redemptions_per_cycle);
    println!("poll interval:      {}s", config.manager.poll_interval_secs);
    match config.lookup_table()? {
        Some(table) => println!("lookup table:       {table}"),
        None => println!("lookup table:       (published at startup)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[ledger]
rpc_url = "http://127.0.0.1:8899"
ws_url = "ws://127.0.0.1:8900"
comet_program_id = "1111111111111111111111111111111111111111111111111111111111111111"
manager_program_id = "2222222222222222222222222222222222222222222222222222222222222222"

[manager]
owner = "3333333333333333333333333333333333333333333333333333333333333333"
target_health_score = 80
"#;

    #[test]
    fn accepts_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Keeper.toml");
        std::fs::write(&path, CONFIG).unwrap();

        check_config(&path, None).unwrap();
    }

    #[test]
    fn rejects_out_of_range_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Keeper.toml");
        std::fs::write(
            &path,
            CONFIG.replace("target_health_score = 80", "target_health_score = 120"),
        )
        .unwrap();

        let err = check_config(&path, None).unwrap_err();
        assert!(format!("{err:#}").contains("target_health_score"));
    }
}
