use crate::db::StoreResult;
use crate::entities::{prelude::*, source_markers};
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set, TransactionTrait};
use std::collections::HashMap;

/// Repository for per-source `since` markers.
pub struct SourceRepository {
    conn: DatabaseConnection,
}

impl SourceRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn markers(&self) -> StoreResult<HashMap<String, String>> {
        let rows = SourceMarkers::find().all(&self.conn).await?;
        Ok(rows.into_iter().map(|r| (r.source_id, r.marker)).collect())
    }

    pub async fn get_marker(&self, source_id: &str) -> StoreResult<Option<String>> {
        let row = SourceMarkers::find_by_id(source_id.to_string())
            .one(&self.conn)
            .await?;
        Ok(row.map(|r| r.marker))
    }

    pub async fn set_marker(&self, source_id: &str, marker: &str) -> StoreResult<()> {
        let active_model = source_markers::ActiveModel {
            source_id: Set(source_id.to_string()),
            marker: Set(marker.to_string()),
            updated_at: Set(chrono::Utc::now().to_rfc3339()),
        };

        let txn = self.conn.begin().await?;
        SourceMarkers::insert(active_model)
            .on_conflict(
                OnConflict::column(source_markers::Column::SourceId)
                    .update_columns([
                        source_markers::Column::Marker,
                        source_markers::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;
        txn.commit().await?;

        Ok(())
    }
}
