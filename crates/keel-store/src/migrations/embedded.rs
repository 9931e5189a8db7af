//! Embedded SQL migrations
//!
//! Migrations are embedded at compile time using include_str!

/// Migration metadata
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub id: &'static str,
    pub sql: &'static str,
}

/// Schema of the pirate demo domain, in order
pub fn demo_migrations() -> Vec<Migration> {
    vec![Migration {
        id: "001_demo_schema",
        sql: include_str!("../../migrations/001_demo_schema.sql"),
    }]
}
