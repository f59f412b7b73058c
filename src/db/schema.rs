diesel::table! {
    companies (id) {
        id -> BigInt,
        name -> Text,
        slug -> Text,
        settings -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    channels (id) {
        id -> BigInt,
        company_id -> BigInt,
        name -> Text,
        provider -> Text,
        external_id -> Nullable<Text>,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    bots (id) {
        id -> BigInt,
        company_id -> BigInt,
        name -> Text,
        is_active -> Bool,
        flow_data -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    channel_bots (id) {
        id -> BigInt,
        company_id -> BigInt,
        channel_id -> BigInt,
        bot_id -> BigInt,
        trigger_conditions -> Text,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> BigInt,
        company_id -> BigInt,
        name -> Text,
        email -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    contacts (id) {
        id -> BigInt,
        company_id -> BigInt,
        phone -> Text,
        name -> Nullable<Text>,
        email -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        metadata -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    conversations (id) {
        id -> BigInt,
        company_id -> BigInt,
        contact_id -> BigInt,
        channel_id -> BigInt,
        status -> Text,
        bot_id -> Nullable<BigInt>,
        assigned_to -> Nullable<BigInt>,
        last_message_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> BigInt,
        company_id -> BigInt,
        conversation_id -> BigInt,
        sender_type -> Text,
        sender_id -> Nullable<BigInt>,
        external_id -> Nullable<Text>,
        body -> Nullable<Text>,
        message_type -> Text,
        attachments -> Text,
        provider_timestamp -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        routed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    tickets (id) {
        id -> BigInt,
        company_id -> BigInt,
        conversation_id -> BigInt,
        ticket_number -> Text,
        subject -> Text,
        reason -> Nullable<Text>,
        status -> Text,
        priority -> Text,
        assigned_to -> Nullable<BigInt>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_events (id) {
        id -> BigInt,
        company_id -> BigInt,
        channel_id -> BigInt,
        event_type -> Text,
        payload -> Text,
        processed -> Bool,
        processing_error -> Nullable<Text>,
        attempts -> Integer,
        retryable -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(channel_bots -> bots (bot_id));

diesel::allow_tables_to_appear_in_same_query!(
    companies,
    channels,
    bots,
    channel_bots,
    users,
    contacts,
    conversations,
    messages,
    tickets,
    webhook_events,
);
