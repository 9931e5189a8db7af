//! Pirate demo domain mapped onto the demo schema of keel-store

use std::sync::Arc;

use keel_core::registry::EntityDescriptor;
use keel_core::{
    CascadeOp, Entity, EntityRef, Registry, Related, SequenceKeyGenerator, Session, SessionConfig,
};
use keel_store::SqliteGateway;

#[derive(Debug, Default)]
pub struct Pirate {
    pub id: Option<i64>,
    pub name: String,
    pub nickname: Option<String>,
    pub bounty: i64,
    pub version: i64,
}

impl Entity for Pirate {
    const ENTITY_TYPE: &'static str = "Pirate";
}

#[derive(Debug, Default)]
pub struct Ship {
    pub id: Option<i64>,
    pub name: String,
    pub version: i64,
    pub crew: Vec<EntityRef<CrewMember>>,
}

impl Entity for Ship {
    const ENTITY_TYPE: &'static str = "Ship";
}

#[derive(Debug, Default)]
pub struct CrewMember {
    pub id: Option<i64>,
    pub name: String,
    pub ship: Option<Related<Ship>>,
}

impl Entity for CrewMember {
    const ENTITY_TYPE: &'static str = "CrewMember";
}

pub fn registry() -> keel_core::Result<Registry> {
    Registry::builder()
        .register(
            EntityDescriptor::builder::<Pirate>()
                .table("pirates")
                .key("id", |p| &p.id, |p| &mut p.id)
                .version("version", |p| &p.version, |p| &mut p.version)
                .field("name", |p| &p.name, |p| &mut p.name)
                .field("nickname", |p| &p.nickname, |p| &mut p.nickname)
                .field("bounty", |p| &p.bounty, |p| &mut p.bounty)
                .build()?,
        )
        .register(
            EntityDescriptor::builder::<Ship>()
                .table("ships")
                .key("id", |s| &s.id, |s| &mut s.id)
                .version("version", |s| &s.version, |s| &mut s.version)
                .field("name", |s| &s.name, |s| &mut s.name)
                .collection("crew", "ship", |s| &s.crew, |s| &mut s.crew)
                .cascade(&CascadeOp::ALL)
                .orphan_removal()
                .build()?,
        )
        .register(
            EntityDescriptor::builder::<CrewMember>()
                .table("crew_members")
                .key("id", |c| &c.id, |c| &mut c.id)
                .field("name", |c| &c.name, |c| &mut c.name)
                .reference("ship", "ship_id", |c| &c.ship, |c| &mut c.ship)
                .build()?,
        )
        .build()
}

/// Registry plus a key source continuing after the stored rows
pub struct Harbor {
    registry: Arc<Registry>,
    keys: Arc<SequenceKeyGenerator>,
    config: SessionConfig,
}

impl Harbor {
    pub fn open(gateway: &SqliteGateway, config: SessionConfig) -> keel_core::Result<Self> {
        let mut keys = SequenceKeyGenerator::new();
        for (entity_type, table) in [
            (Pirate::ENTITY_TYPE, "pirates"),
            (Ship::ENTITY_TYPE, "ships"),
            (CrewMember::ENTITY_TYPE, "crew_members"),
        ] {
            if let Some(last) = gateway.max_key(table, "id")? {
                keys = keys.starting_after(entity_type, last);
            }
        }
        Ok(Self {
            registry: Arc::new(registry()?),
            keys: Arc::new(keys),
            config,
        })
    }

    pub fn session(&self) -> Session {
        Session::with_config(self.registry.clone(), self.keys.clone(), self.config.clone())
    }
}
