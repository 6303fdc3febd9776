table! {
    assets {
        id -> Integer,
        external_id -> Text,
        name -> Text,
    }
}

table! {
    prices {
        id -> Integer,
        asset_id -> Integer,
        unix_time -> Double,
        timestamp -> Text,
        price -> Double,
    }
}

table! {
    alert_config (key) {
        key -> Integer,
        interval_minutes -> Double,
        mode -> Text,
        mail_address -> Nullable<Text>,
        mail_password -> Nullable<Text>,
    }
}

joinable!(prices -> assets (asset_id));
allow_tables_to_appear_in_same_query!(assets, prices);
