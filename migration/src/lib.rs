pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_pdv;
mod m20250301_000002_create_profile;
mod m20250301_000003_create_rewards_queue;
mod m20250301_000004_create_pipeline_state;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_pdv::Migration),
            Box::new(m20250301_000002_create_profile::Migration),
            Box::new(m20250301_000003_create_rewards_queue::Migration),
            Box::new(m20250301_000004_create_pipeline_state::Migration),
        ]
    }
}
