use crate::entities::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Schema;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        let schema = Schema::new(backend);

        manager
            .create_table(
                schema
                    .create_table_from_entity(Works)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                schema
                    .create_table_from_entity(WorkSources)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                schema
                    .create_table_from_entity(Releases)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        let conn = manager.get_connection();

        // One canonical work per folded title within a media kind.
        conn.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_works_kind_title_key ON works(media_kind, title_key)",
        )
        .await?;

        // The release tuple; inserts rely on it for insert-or-ignore.
        conn.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_releases_unique_tuple \
             ON releases(work_id, release_kind, label, channel, release_date)",
        )
        .await?;

        conn.execute_unprepared(
            "CREATE INDEX IF NOT EXISTS idx_releases_pending \
             ON releases(notified, needs_review, release_date)",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Releases).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkSources).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Works).to_owned())
            .await?;

        Ok(())
    }
}
