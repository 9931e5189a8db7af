use std::path::PathBuf;
use std::sync::Arc;

use keel_core::registry::EntityDescriptor;
use keel_core::{
    CascadeOp, Entity, EntityRef, Registry, Related, SequenceKeyGenerator, Session,
};
use keel_store::migrations::{apply_migrations, demo_migrations};
use keel_store::SqliteGateway;
use tempfile::TempDir;

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

fn registry() -> Registry {
    Registry::builder()
        .register(
            EntityDescriptor::builder::<Pirate>()
                .table("pirates")
                .key("id", |p| &p.id, |p| &mut p.id)
                .version("version", |p| &p.version, |p| &mut p.version)
                .field("name", |p| &p.name, |p| &mut p.name)
                .field("nickname", |p| &p.nickname, |p| &mut p.nickname)
                .field("bounty", |p| &p.bounty, |p| &mut p.bounty)
                .build()
                .unwrap(),
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
                .build()
                .unwrap(),
        )
        .register(
            EntityDescriptor::builder::<CrewMember>()
                .table("crew_members")
                .key("id", |c| &c.id, |c| &mut c.id)
                .field("name", |c| &c.name, |c| &mut c.name)
                .reference("ship", "ship_id", |c| &c.ship, |c| &mut c.ship)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

/// A migrated database file plus the registry and keys of one test
pub struct Harbor {
    _dir: TempDir,
    path: PathBuf,
    pub registry: Arc<Registry>,
    pub keys: Arc<SequenceKeyGenerator>,
}

impl Harbor {
    /// Fresh database with the demo schema; new keys start after 100
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("harbor.db");
        let mut gateway = SqliteGateway::open(&path).unwrap();
        apply_migrations(gateway.connection_mut(), &demo_migrations()).unwrap();
        Self {
            _dir: dir,
            path,
            registry: Arc::new(registry()),
            keys: Arc::new(
                SequenceKeyGenerator::new()
                    .starting_after("Pirate", 100)
                    .starting_after("Ship", 100)
                    .starting_after("CrewMember", 100),
            ),
        }
    }

    /// A separate connection, as another process would hold
    pub fn connect(&self) -> SqliteGateway {
        SqliteGateway::open(&self.path).unwrap()
    }

    pub fn session(&self) -> Session {
        Session::new(self.registry.clone(), self.keys.clone())
    }

    #[allow(dead_code)]
    pub fn seed_pirate(&self, id: i64, name: &str, bounty: i64) {
        self.connect()
            .connection()
            .execute(
                "INSERT INTO pirates (id, name, nickname, bounty, version) VALUES (?1, ?2, NULL, ?3, 0)",
                rusqlite::params![id, name, bounty],
            )
            .unwrap();
    }

    #[allow(dead_code)]
    pub fn seed_ship(&self, id: i64, name: &str, crew: &[(i64, &str)]) {
        let gateway = self.connect();
        let conn = gateway.connection();
        conn.execute(
            "INSERT INTO ships (id, name, version) VALUES (?1, ?2, 0)",
            rusqlite::params![id, name],
        )
        .unwrap();
        for (crew_id, crew_name) in crew {
            conn.execute(
                "INSERT INTO crew_members (id, name, ship_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![crew_id, crew_name, id],
            )
            .unwrap();
        }
    }

    /// Single integer from a query against the database file
    #[allow(dead_code)]
    pub fn scalar(&self, sql: &str) -> Option<i64> {
        self.connect()
            .connection()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    #[allow(dead_code)]
    pub fn text(&self, sql: &str) -> Option<String> {
        self.connect()
            .connection()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }
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
