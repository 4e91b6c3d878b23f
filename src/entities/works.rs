use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "works")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub canonical_title: String,
    /// Folded canonical title; unique together with `media_kind`.
    pub title_key: String,
    pub media_kind: String,
    pub status: String,
    /// JSON array of alternate titles in the order they were first seen.
    pub alternate_titles: String,
    /// JSON array of external reference URLs.
    pub external_urls: String,
    pub provenance_count: i32,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::releases::Entity")]
    Releases,
    #[sea_orm(has_many = "super::work_sources::Entity")]
    WorkSources,
}

impl Related<super::releases::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Releases.def()
    }
}

impl Related<super::work_sources::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WorkSources.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
