//! Database row types. These map directly to SQLite rows and stay
//! independent of the wire documents in liaison-types.

pub struct ConversationRow {
    pub id: String,
    pub preview_cipher_text: Option<String>,
    pub preview_iv: Option<String>,
    pub last_message_at: Option<String>,
    pub last_sender_role: Option<String>,
    pub flagged: bool,
    pub seen_by_counsellor_at: Option<String>,
    pub seen_by_beneficiary_at: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_role: String,
    pub author_id: Option<String>,
    pub created_at: String,
    pub encrypted_body: Option<String>,
    pub iv: Option<String>,
    pub kind: String,
    pub kind_payload: Option<String>,
    pub broadcast_id: Option<String>,
}

pub struct BroadcastListRow {
    pub id: String,
    pub owner_id: String,
    pub title: String,
}

pub struct BroadcastMessageRow {
    pub id: String,
    pub list_id: String,
    pub author_id: String,
    pub created_at: String,
    pub content: String,
}
