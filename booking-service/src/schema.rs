diesel::table! {
    bookings (id) {
        id -> Uuid,
        reservation_id -> Uuid,
        professional_id -> Uuid,
        service_id -> Uuid,
        client_name -> Varchar,
        client_email -> Varchar,
        client_phone -> Nullable<Varchar>,
        notes -> Nullable<Text>,
        start_time -> Timestamptz,
        end_time -> Timestamptz,
        duration_minutes -> Int4,
        price -> Numeric,
        status -> Varchar,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    services (id) {
        id -> Uuid,
        name -> Varchar,
        duration_minutes -> Int4,
        price -> Numeric,
        active -> Bool,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    services,
);
