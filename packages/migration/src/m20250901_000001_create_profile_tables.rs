use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ----- Iden enums for tables & columns -----
#[derive(Iden)]
enum RequestProfiles {
    Table,
    Id,
    Method,
    Path,
    Params,
    StatusCode,
    UserName,
    StartedAt,
    EndedAt,
    DurationMs,
    CreatedAt,
}

#[derive(Iden)]
enum JobProfiles {
    Table,
    Id,
    Name,
    Metas,
    StartedAt,
    EndedAt,
    DurationMs,
    CreatedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RequestProfiles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RequestProfiles::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RequestProfiles::Method).string().not_null())
                    .col(ColumnDef::new(RequestProfiles::Path).string().not_null())
                    .col(ColumnDef::new(RequestProfiles::Params).json_binary())
                    .col(
                        ColumnDef::new(RequestProfiles::StatusCode)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RequestProfiles::UserName).string())
                    .col(
                        ColumnDef::new(RequestProfiles::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestProfiles::EndedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestProfiles::DurationMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RequestProfiles::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_request_profiles_path")
                    .table(RequestProfiles::Table)
                    .col(RequestProfiles::Path)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobProfiles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobProfiles::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobProfiles::Name).string().not_null())
                    .col(ColumnDef::new(JobProfiles::Metas).json_binary())
                    .col(
                        ColumnDef::new(JobProfiles::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobProfiles::EndedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobProfiles::DurationMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobProfiles::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_profiles_name")
                    .table(JobProfiles::Table)
                    .col(JobProfiles::Name)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobProfiles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RequestProfiles::Table).to_owned())
            .await
    }
}
