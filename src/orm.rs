#[allow(warnings, clippy::all)]
pub(crate) mod short_url {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "urls")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        #[sea_orm(column_type = "Text")]
        pub original_url: String,
        #[sea_orm(unique)]
        pub short_code: String,
        #[sea_orm(default_expr = "Expr::current_timestamp()")]
        pub created_at: TimeDateTimeWithTimeZone,
        #[sea_orm(default_value = 0)]
        pub clicks: i64,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
