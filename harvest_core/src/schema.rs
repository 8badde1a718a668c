diesel::table! {
    jobs (job_id) {
        job_id -> Text,
        status -> Text,
        config_json -> Text,
        started_at -> Text,
        updated_at -> Text,
        finished_at -> Nullable<Text>,
    }
}

diesel::table! {
    pages (id) {
        id -> Integer,
        job_id -> Text,
        page_num -> Integer,
        page_url -> Text,
        source_id -> Text,
        status -> Text,
        last_completed_image_index -> Integer,
        image_count -> Integer,
        error -> Nullable<Text>,
        started_at -> Text,
        updated_at -> Text,
        finished_at -> Nullable<Text>,
    }
}

diesel::table! {
    images (id) {
        id -> Integer,
        page_id -> Integer,
        image_index -> Integer,
        url -> Text,
        local_path -> Text,
        status -> Text,
        retries -> Integer,
        http_status -> Nullable<Integer>,
        content_type -> Nullable<Text>,
        size_bytes -> Nullable<BigInt>,
        sha256 -> Nullable<Text>,
        downloaded_at -> Nullable<Text>,
        error -> Nullable<Text>,
        updated_at -> Text,
    }
}

diesel::table! {
    events (id) {
        id -> Integer,
        job_id -> Text,
        page_id -> Nullable<Integer>,
        event_type -> Text,
        message -> Text,
        created_at -> Text,
    }
}

diesel::joinable!(pages -> jobs (job_id));
diesel::joinable!(images -> pages (page_id));
diesel::joinable!(events -> jobs (job_id));

diesel::allow_tables_to_appear_in_same_query!(jobs, pages, images, events);
