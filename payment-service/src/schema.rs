diesel::table! {
    payments (id) {
        id -> Uuid,
        product_id -> Varchar,
        purchase_time -> Timestamptz,
        quantity -> Int4,
        total_price -> Numeric,
        status -> Varchar,
        gateway_name -> Nullable<Varchar>,
    }
}
