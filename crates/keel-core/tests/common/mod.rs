use std::sync::Arc;

use keel_core::registry::EntityDescriptor;
use keel_core::{
    CascadeOp, Entity, EntityRef, MemoryGateway, Registry, Related, Row, SequenceKeyGenerator,
    Session, SessionConfig, Value,
};

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

pub fn pirate_descriptor() -> EntityDescriptor {
    EntityDescriptor::builder::<Pirate>()
        .table("pirates")
        .key("id", |p| &p.id, |p| &mut p.id)
        .version("version", |p| &p.version, |p| &mut p.version)
        .field("name", |p| &p.name, |p| &mut p.name)
        .field("nickname", |p| &p.nickname, |p| &mut p.nickname)
        .field("bounty", |p| &p.bounty, |p| &mut p.bounty)
        .build()
        .unwrap()
}

fn ship_descriptor(orphan_removal: bool) -> EntityDescriptor {
    let builder = EntityDescriptor::builder::<Ship>()
        .table("ships")
        .key("id", |s| &s.id, |s| &mut s.id)
        .version("version", |s| &s.version, |s| &mut s.version)
        .field("name", |s| &s.name, |s| &mut s.name)
        .collection("crew", "ship", |s| &s.crew, |s| &mut s.crew)
        .cascade(&CascadeOp::ALL);
    let builder = if orphan_removal {
        builder.orphan_removal()
    } else {
        builder
    };
    builder.build().unwrap()
}

fn crew_descriptor() -> EntityDescriptor {
    EntityDescriptor::builder::<CrewMember>()
        .table("crew_members")
        .key("id", |c| &c.id, |c| &mut c.id)
        .field("name", |c| &c.name, |c| &mut c.name)
        .reference("ship", "ship_id", |c| &c.ship, |c| &mut c.ship)
        .build()
        .unwrap()
}

/// Registry and key source shared by every session of one test
pub struct Fixture {
    pub registry: Arc<Registry>,
    pub keys: Arc<SequenceKeyGenerator>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_orphan_removal(true)
    }

    /// Same domain, with or without orphan removal on `Ship.crew`
    pub fn with_orphan_removal(orphan_removal: bool) -> Self {
        let registry = Registry::builder()
            .register(pirate_descriptor())
            .register(ship_descriptor(orphan_removal))
            .register(crew_descriptor())
            .build()
            .unwrap();
        Self {
            registry: Arc::new(registry),
            keys: Arc::new(SequenceKeyGenerator::new()),
        }
    }

    /// Keys continue after rows seeded by the test
    #[allow(dead_code)]
    pub fn starting_after(last_key: i64) -> Self {
        let mut fixture = Self::new();
        fixture.keys = Arc::new(
            SequenceKeyGenerator::new()
                .starting_after("Pirate", last_key)
                .starting_after("Ship", last_key)
                .starting_after("CrewMember", last_key),
        );
        fixture
    }

    pub fn session(&self) -> Session {
        Session::new(self.registry.clone(), self.keys.clone())
    }

    #[allow(dead_code)]
    pub fn session_with(&self, config: SessionConfig) -> Session {
        Session::with_config(self.registry.clone(), self.keys.clone(), config)
    }
}

/// Memory gateway enforcing the crew foreign key
pub fn gateway() -> MemoryGateway {
    MemoryGateway::new().with_foreign_key("crew_members", "ship_id", "ships")
}

pub fn row(values: &[(&str, Value)]) -> Row {
    values
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

#[allow(dead_code)]
pub fn pirate(name: &str, bounty: i64) -> EntityRef<Pirate> {
    EntityRef::new(Pirate {
        name: name.to_string(),
        bounty,
        ..Default::default()
    })
}

#[allow(dead_code)]
pub fn crew_member(name: &str) -> EntityRef<CrewMember> {
    EntityRef::new(CrewMember {
        name: name.to_string(),
        ..Default::default()
    })
}

/// Store Pirate #`id` at version 0 directly in the gateway
#[allow(dead_code)]
pub fn seed_pirate(gateway: &mut MemoryGateway, id: i64, name: &str, bounty: i64) {
    gateway
        .seed(
            "pirates",
            "id",
            row(&[
                ("id", Value::Int(id)),
                ("name", Value::from(name)),
                ("nickname", Value::Null),
                ("bounty", Value::Int(bounty)),
                ("version", Value::Int(0)),
            ]),
        )
        .unwrap();
}

/// Store Ship #`id` with one crew row per `(crew id, name)`
#[allow(dead_code)]
pub fn seed_ship(gateway: &mut MemoryGateway, id: i64, name: &str, crew: &[(i64, &str)]) {
    gateway
        .seed(
            "ships",
            "id",
            row(&[
                ("id", Value::Int(id)),
                ("name", Value::from(name)),
                ("version", Value::Int(0)),
            ]),
        )
        .unwrap();
    for (crew_id, crew_name) in crew {
        gateway
            .seed(
                "crew_members",
                "id",
                row(&[
                    ("id", Value::Int(*crew_id)),
                    ("name", Value::from(*crew_name)),
                    ("ship_id", Value::Int(id)),
                ]),
            )
            .unwrap();
    }
}
