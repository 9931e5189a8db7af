//! Walk through one unit of work per engine feature against SQLite

use std::error::Error;

use clap::Args;
use keel_core::relations::link;
use keel_core::{EntityRef, FlushSummary};
use serde::Serialize;

use super::{list, open_database};
use crate::config::CliConfig;
use crate::domain::{CrewMember, Harbor, Pirate, Ship};

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Name of the ship to launch; ship names are unique
    #[arg(long, default_value = "Black Pearl")]
    pub ship: String,

    /// Print one JSON object per step instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Step<'a> {
    step: &'a str,
    summary: &'a FlushSummary,
}

fn report(args: &DemoArgs, step: &str, summary: &FlushSummary) -> Result<(), Box<dyn Error>> {
    if args.json {
        println!("{}", serde_json::to_string(&Step { step, summary })?);
    } else {
        let updated: Vec<String> = summary
            .updated
            .iter()
            .map(|u| format!("{} [{}]", u.identity, u.fields.join(", ")))
            .collect();
        println!(
            "{:<8} inserted: {} | updated: {} | deleted: {}",
            step,
            list(&summary.inserted),
            list(&updated),
            list(&summary.deleted)
        );
    }
    Ok(())
}

fn recruit(name: &str) -> EntityRef<CrewMember> {
    EntityRef::new(CrewMember {
        name: name.to_string(),
        ..Default::default()
    })
}

pub fn execute(args: DemoArgs, config: &CliConfig) -> Result<(), Box<dyn Error>> {
    let mut gateway = open_database(config)?;
    let harbor = Harbor::open(&gateway, config.session.clone())?;

    // Launch: a new ship, its crew and a captain, inserted in FK order.
    let mut session = harbor.session();
    let ship = EntityRef::new(Ship {
        name: args.ship.clone(),
        ..Default::default()
    });
    for name in ["Gibbs", "Cotton", "Marty"] {
        link(&ship, &recruit(name), |s| &mut s.crew, |c| &mut c.ship);
    }
    let captain = EntityRef::new(Pirate {
        name: "Jack".to_string(),
        bounty: 10_000,
        ..Default::default()
    });
    let ship_id = session.persist(&ship)?;
    let captain_id = session.persist(&captain)?;
    report(&args, "launch", &session.commit(&mut gateway)?)?;

    // Bounty: one field changes, one minimal update.
    let mut session = harbor.session();
    let jack = session
        .find::<Pirate>(&mut gateway, captain_id.key.clone())?
        .ok_or("captain vanished")?;
    jack.update(|p| p.bounty *= 2);
    report(&args, "bounty", &session.flush(&mut gateway)?)?;

    // Orphan: dropping a crew member deletes that row.
    let ship = session
        .find::<Ship>(&mut gateway, ship_id.key.clone())?
        .ok_or("ship vanished")?;
    session.load_collection(&mut gateway, &ship, "crew")?;
    ship.update(|s| {
        s.crew.retain(|member| member.read(|m| m.name != "Marty"));
    });
    report(&args, "orphan", &session.commit(&mut gateway)?)?;

    // Merge: the captain is renamed while detached, then merged back.
    jack.update(|p| p.nickname = Some("Captain".to_string()));
    let mut session = harbor.session();
    let merged = session.merge(&jack)?;
    let summary = session.commit(&mut gateway)?;
    report(&args, "merge", &summary)?;

    tracing::info!(
        ship = %ship_id,
        captain = %captain_id,
        version = merged.read(|p| p.version),
        "demo finished"
    );
    Ok(())
}
