//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Relational sink: one row per event in an append-only table
//!
//! Rows are keyed by `(run_id, connection_id, sequence)`. `run_id` is the
//! process start time in milliseconds, so connection ids restarting at 1
//! after a restart never collide with earlier rows.

use super::EventSink;
use crate::error::SinkError;
use crate::event::Event;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema, Set};
use tracing::info;

pub mod entity {
    //! `honeypot_events` table

    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "honeypot_events")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub run_id: i64,
        #[sea_orm(primary_key, auto_increment = false)]
        pub connection_id: i64,
        #[sea_orm(primary_key, auto_increment = false)]
        pub sequence: i64,
        pub timestamp: DateTimeUtc,
        pub plugin: String,
        pub kind: String,
        pub severity: String,
        pub source: Option<String>,
        #[sea_orm(column_type = "Text")]
        pub payload: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Inserts events through SeaORM
pub struct DatabaseSink {
    url: String,
    run_id: i64,
    db: Option<DatabaseConnection>,
}

impl DatabaseSink {
    /// Create a sink; the connection is opened on first write
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            run_id: Utc::now().timestamp_millis(),
            db: None,
        }
    }

    /// Identifier of this process's rows
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Open (and migrate) the database if not yet connected
    pub async fn connection(&mut self) -> Result<&DatabaseConnection, SinkError> {
        if self.db.is_none() {
            let db = Database::connect(self.url.as_str()).await?;
            let backend = db.get_database_backend();
            let schema = Schema::new(backend);
            let stmt = schema
                .create_table_from_entity(entity::Entity)
                .if_not_exists()
                .to_owned();
            db.execute(backend.build(&stmt)).await?;
            info!("Event table ready");
            self.db = Some(db);
        }
        self.db.as_ref().ok_or(SinkError::Closed)
    }

    fn to_row(&self, event: &Event) -> Result<entity::ActiveModel, SinkError> {
        Ok(entity::ActiveModel {
            run_id: Set(self.run_id),
            connection_id: Set(event.connection_id.as_u64() as i64),
            sequence: Set(event.sequence as i64),
            timestamp: Set(event.timestamp),
            plugin: Set(event.plugin.clone()),
            kind: Set(event.kind.as_str().to_string()),
            severity: Set(event.severity.as_str().to_string()),
            source: Set(event.source.map(|s| s.to_string())),
            payload: Set(serde_json::to_string(&event.payload)?),
        })
    }
}

impl std::fmt::Debug for DatabaseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSink")
            .field("run_id", &self.run_id)
            .field("connected", &self.db.is_some())
            .finish()
    }
}

#[async_trait]
impl EventSink for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    async fn write(&mut self, event: &Event) -> Result<(), SinkError> {
        let row = self.to_row(event)?;
        let result = {
            let db = self.connection().await?;
            entity::Entity::insert(row).exec_without_returning(db).await
        };
        if let Err(e) = result {
            // Reconnect on the next attempt
            self.db = None;
            return Err(e.into());
        }
        Ok(())
    }
}
