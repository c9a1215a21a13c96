//! SeaORM migrations for the shared state store

use sea_orm_migration::prelude::*;

pub mod m20251019_000001_state_store;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20251019_000001_state_store::Migration)]
    }
}
