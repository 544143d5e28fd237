diesel::table! {
    products (id) {
        id -> Varchar,
        name -> Varchar,
        info -> Varchar,
        inventory_count -> Int4,
        price -> Float8,
    }
}
