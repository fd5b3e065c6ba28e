//! CLI entry point.
//!
//! # Responsibility
//! - Print a linkage probe when run without arguments.
//! - Scan a configured store for inactive entities whose cascades did not
//!   complete, and optionally repair them.

use log::info;
use std::process::ExitCode;
use tether_core::{CascadeEngine, CoreConfig, EntityQuery, EntityStore, LifecyclePolicy, Store};

const USAGE: &str = "usage: tether_cli [reconcile <config.json> [--apply]]";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {
            println!("tether_core ping={}", tether_core::ping());
            println!("tether_core version={}", tether_core::core_version());
            ExitCode::SUCCESS
        }
        [command, config_path, rest @ ..] if command == "reconcile" => {
            let apply = match rest {
                [] => false,
                [flag] if flag == "--apply" => true,
                _ => return usage(),
            };
            match reconcile(config_path, apply) {
                Ok(()) => ExitCode::SUCCESS,
                Err(message) => {
                    eprintln!("error: {message}");
                    ExitCode::FAILURE
                }
            }
        }
        _ => usage(),
    }
}

fn usage() -> ExitCode {
    eprintln!("{USAGE}");
    ExitCode::from(2)
}

fn reconcile(config_path: &str, apply: bool) -> Result<(), String> {
    let config = CoreConfig::load(config_path).map_err(|err| err.to_string())?;
    config.init_logging().map_err(|err| err.to_string())?;
    let policy = config.load_policy().map_err(|err| err.to_string())?;
    let store = config.open_store().map_err(|err| err.to_string())?;

    let report = scan(&store, &policy, apply).map_err(|err| err.to_string());
    store.close().map_err(|err| err.to_string())?;
    let (stale_entities, repaired) = report?;

    info!(
        "event=cli_reconcile module=cli status=ok apply={} stale_entities={} repaired={}",
        apply, stale_entities, repaired
    );
    println!("stale_entities={stale_entities} repaired_relationships={repaired}");
    Ok(())
}

fn scan(
    store: &Store,
    policy: &LifecyclePolicy,
    apply: bool,
) -> Result<(usize, usize), tether_core::CoreError> {
    let entities = EntityStore::new(store.entities(), policy);
    let engine = CascadeEngine::new(store.connection(), policy);

    let inactive = entities
        .find(EntityQuery::new().active(false))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stale_entities = 0;
    let mut repaired = 0;
    for entity in inactive {
        let stale = engine.stale_relationships(entity.id)?;
        if stale.is_empty() {
            continue;
        }
        stale_entities += 1;
        println!(
            "entity={} kind={} stale_relationships={}",
            entity.id,
            entity.kind,
            stale.len()
        );
        if apply {
            let outcome = engine.reconcile_entity(entity.id)?;
            repaired += outcome.affected;
            println!("entity={} repaired={}", entity.id, outcome.affected);
        }
    }
    Ok((stale_entities, repaired))
}
