use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "releases")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub work_id: i32,
    pub release_kind: String,
    pub label: String,
    pub channel: String,
    /// ISO `YYYY-MM-DD`; lexical order is chronological order.
    pub release_date: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub notified: bool,
    pub notified_at: Option<String>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub needs_review: bool,
    pub created_at: String,
    pub archived_at: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::works::Entity",
        from = "Column::WorkId",
        to = "super::works::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Works,
    #[sea_orm(has_many = "super::release_notifications::Entity")]
    ReleaseNotifications,
}

impl Related<super::works::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Works.def()
    }
}

impl Related<super::release_notifications::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ReleaseNotifications.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
