use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use parley_types::{Chat, ChatMessage, ChatSummary, MessageRole};

pub const CHATS_FILE: &str = "chats.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Chat not found")]
    ChatNotFound,
    #[error("Message not found")]
    MessageNotFound,
    #[error("{0}")]
    Validation(String),
    #[error("chat store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chat store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyImportCounts {
    pub chats: u64,
    pub messages: u64,
    pub skipped: u64,
}

/// Chat sessions for every user, persisted as one pretty-printed JSON object
/// keyed by chat id. All mutations rewrite the file before returning.
pub struct ChatStore {
    base: PathBuf,
    chats: RwLock<HashMap<String, Chat>>,
}

impl ChatStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let chats_file = base.join(CHATS_FILE);
        let chats = if chats_file.exists() {
            let raw = fs::read_to_string(&chats_file).await?;
            match serde_json::from_str::<HashMap<String, Chat>>(&raw) {
                Ok(chats) => chats,
                Err(err) => {
                    tracing::warn!(
                        path = %chats_file.display(),
                        error = %err,
                        "chat store file is unreadable; starting with an empty collection"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            chats: RwLock::new(chats),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.base.join(CHATS_FILE)
    }

    pub async fn list_chats(&self, owner: &str) -> Vec<ChatSummary> {
        let chats = self.chats.read().await;
        let mut owned = chats
            .values()
            .filter(|chat| chat.owner == owner)
            .collect::<Vec<_>>();
        owned.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        owned.into_iter().map(ChatSummary::from).collect()
    }

    pub async fn get_chat(&self, owner: &str, id: &str) -> Option<Chat> {
        self.chats
            .read()
            .await
            .get(id)
            .filter(|chat| chat.owner == owner)
            .cloned()
    }

    pub async fn create_chat(&self, owner: &str, title: Option<&str>) -> Result<Chat, StoreError> {
        self.mutate(|chats| {
            let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
                Some(title) => title.to_string(),
                None => {
                    let owned = chats.values().filter(|chat| chat.owner == owner).count();
                    format!("Chat {}", owned + 1)
                }
            };
            let chat = Chat::new(owner, title);
            chats.insert(chat.id.clone(), chat.clone());
            Ok(chat)
        })
        .await
    }

    pub async fn rename_chat(
        &self,
        owner: &str,
        id: &str,
        title: &str,
    ) -> Result<String, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::Validation("Title cannot be empty".to_string()));
        }
        self.mutate(|chats| {
            let chat = owned_chat_mut(chats, owner, id)?;
            chat.title = title.to_string();
            chat.touch();
            Ok(title.to_string())
        })
        .await
    }

    pub async fn delete_chat(&self, owner: &str, id: &str) -> Result<(), StoreError> {
        self.mutate(|chats| {
            owned_chat_mut(chats, owner, id)?;
            chats.remove(id);
            Ok(())
        })
        .await
    }

    /// Appends a user message and the model's reply in one write so a chat
    /// never holds a question without its answer.
    pub async fn append_exchange(
        &self,
        owner: &str,
        id: &str,
        user: ChatMessage,
        assistant: ChatMessage,
    ) -> Result<Chat, StoreError> {
        self.mutate(|chats| {
            let chat = owned_chat_mut(chats, owner, id)?;
            chat.messages.push(user);
            chat.messages.push(assistant);
            chat.touch();
            Ok(chat.clone())
        })
        .await
    }

    /// Removes the message at `index` and every message after it.
    pub async fn truncate_messages(
        &self,
        owner: &str,
        id: &str,
        index: usize,
    ) -> Result<Chat, StoreError> {
        self.mutate(|chats| {
            let chat = owned_chat_mut(chats, owner, id)?;
            if index >= chat.messages.len() {
                return Err(StoreError::MessageNotFound);
            }
            chat.messages.truncate(index);
            chat.touch();
            Ok(chat.clone())
        })
        .await
    }

    /// Imports a `saved_chats.json` written by the earlier single-user app.
    /// Chat ids already in the store are left alone.
    pub async fn import_legacy_file(
        &self,
        path: impl AsRef<Path>,
        owner: &str,
    ) -> Result<LegacyImportCounts, StoreError> {
        let raw = fs::read_to_string(path.as_ref()).await?;
        let mut legacy = serde_json::from_str::<HashMap<String, LegacyChat>>(&raw)?;
        let mut ids = legacy.keys().cloned().collect::<Vec<_>>();
        ids.sort();

        self.mutate(|chats| {
            let mut counts = LegacyImportCounts::default();
            for (position, id) in ids.into_iter().enumerate() {
                let Some(entry) = legacy.remove(&id) else {
                    continue;
                };
                if chats.contains_key(&id) {
                    counts.skipped += 1;
                    continue;
                }
                let chat = entry.into_chat(id, owner, position + 1);
                counts.chats += 1;
                counts.messages += chat.messages.len() as u64;
                chats.insert(chat.id.clone(), chat);
            }
            Ok(counts)
        })
        .await
    }

    /// Applies `change` to a copy of the collection, writes the copy, and only
    /// then makes it visible. A failed change or a failed write leaves both the
    /// file and the in-memory map as they were.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, Chat>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut chats = self.chats.write().await;
        let mut next = chats.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *chats = next;
        Ok(out)
    }

    async fn persist(&self, chats: &HashMap<String, Chat>) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(chats)?;
        let target = self.path();
        let staging = self.base.join(format!("{CHATS_FILE}.tmp"));
        fs::write(&staging, payload).await?;
        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        Ok(())
    }
}

fn owned_chat_mut<'a>(
    chats: &'a mut HashMap<String, Chat>,
    owner: &str,
    id: &str,
) -> Result<&'a mut Chat, StoreError> {
    chats
        .get_mut(id)
        .filter(|chat| chat.owner == owner)
        .ok_or(StoreError::ChatNotFound)
}

#[derive(Debug, Deserialize)]
struct LegacyChat {
    title: Option<String>,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    role: String,
    #[serde(default)]
    content: String,
    timestamp: Option<String>,
}

impl LegacyChat {
    fn into_chat(self, id: String, owner: &str, position: usize) -> Chat {
        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_legacy_timestamp)
            .unwrap_or_else(Utc::now);
        let messages = self
            .messages
            .into_iter()
            .map(|msg| ChatMessage {
                role: legacy_role_to_message_role(&msg.role),
                content: msg.content,
                timestamp: msg
                    .timestamp
                    .as_deref()
                    .and_then(parse_legacy_timestamp)
                    .unwrap_or(created_at),
            })
            .collect::<Vec<_>>();
        let updated_at = messages
            .iter()
            .map(|m| m.timestamp)
            .max()
            .unwrap_or(created_at);
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("Chat {position}"));
        Chat {
            id,
            owner: owner.to_string(),
            title,
            messages,
            created_at,
            updated_at,
        }
    }
}

fn legacy_role_to_message_role(role: &str) -> MessageRole {
    match role.to_lowercase().as_str() {
        "user" => MessageRole::User,
        _ => MessageRole::Assistant,
    }
}

/// The old app wrote naive local ISO timestamps; they are read as UTC.
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use uuid::Uuid;

    fn scratch(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("parley-core-{label}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_assigns_default_titles_per_owner() {
        let base = scratch("titles");
        let store = ChatStore::new(&base).await.expect("store");
        let first = store.create_chat("alice", None).await.expect("first");
        let second = store.create_chat("alice", Some("   ")).await.expect("second");
        let bobs = store.create_chat("bob", None).await.expect("bob");
        let named = store.create_chat("alice", Some(" Trip ")).await.expect("named");

        assert_eq!(first.title, "Chat 1");
        assert_eq!(second.title, "Chat 2");
        assert_eq!(bobs.title, "Chat 1");
        assert_eq!(named.title, "Trip");
        assert!(Uuid::parse_str(&first.id).is_ok());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn chats_are_invisible_to_other_owners() {
        let base = scratch("owners");
        let store = ChatStore::new(&base).await.expect("store");
        let chat = store.create_chat("alice", None).await.expect("chat");

        assert!(store.get_chat("bob", &chat.id).await.is_none());
        assert!(store.list_chats("bob").await.is_empty());
        assert!(matches!(
            store.delete_chat("bob", &chat.id).await,
            Err(StoreError::ChatNotFound)
        ));
        assert!(matches!(
            store.rename_chat("bob", &chat.id, "mine now").await,
            Err(StoreError::ChatNotFound)
        ));
        assert!(store.get_chat("alice", &chat.id).await.is_some());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn mutations_survive_a_reload() {
        let base = scratch("reload");
        let store = ChatStore::new(&base).await.expect("store");
        let chat = store.create_chat("alice", None).await.expect("chat");
        store
            .append_exchange(
                "alice",
                &chat.id,
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi there"),
            )
            .await
            .expect("append");
        store
            .rename_chat("alice", &chat.id, "Greetings")
            .await
            .expect("rename");
        drop(store);

        let reopened = ChatStore::new(&base).await.expect("reopen");
        let loaded = reopened.get_chat("alice", &chat.id).await.expect("loaded");
        assert_eq!(loaded.title, "Greetings");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].role, MessageRole::User);
        assert_eq!(loaded.messages[1].content, "hi there");
        assert!(!base.join(format!("{CHATS_FILE}.tmp")).exists());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_and_disk_unchanged() {
        let base = scratch("failed-write");
        let store = ChatStore::new(&base).await.expect("store");
        let chat = store.create_chat("alice", Some("Kept")).await.expect("chat");
        // A directory at the staging path makes every write fail.
        stdfs::create_dir_all(base.join(format!("{CHATS_FILE}.tmp"))).expect("block staging");

        assert!(matches!(
            store
                .append_exchange(
                    "alice",
                    &chat.id,
                    ChatMessage::user("hello"),
                    ChatMessage::assistant("hi"),
                )
                .await,
            Err(StoreError::Io(_))
        ));
        assert!(store.create_chat("alice", None).await.is_err());
        assert!(store.rename_chat("alice", &chat.id, "Lost").await.is_err());
        assert!(store.delete_chat("alice", &chat.id).await.is_err());

        let in_memory = store.get_chat("alice", &chat.id).await.expect("still listed");
        assert_eq!(in_memory.title, "Kept");
        assert!(in_memory.messages.is_empty());
        assert_eq!(store.list_chats("alice").await.len(), 1);

        let on_disk: HashMap<String, Chat> =
            serde_json::from_str(&stdfs::read_to_string(store.path()).expect("read"))
                .expect("parse");
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk[&chat.id].messages.is_empty());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn rename_rejects_blank_titles() {
        let base = scratch("rename");
        let store = ChatStore::new(&base).await.expect("store");
        let chat = store.create_chat("alice", None).await.expect("chat");
        let err = store
            .rename_chat("alice", &chat.id, "  ")
            .await
            .expect_err("blank");
        assert_eq!(err.to_string(), "Title cannot be empty");
        assert!(matches!(
            store.rename_chat("alice", "missing", "x").await,
            Err(StoreError::ChatNotFound)
        ));
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn truncate_drops_message_and_everything_after() {
        let base = scratch("truncate");
        let store = ChatStore::new(&base).await.expect("store");
        let chat = store.create_chat("alice", None).await.expect("chat");
        for n in 0..2 {
            store
                .append_exchange(
                    "alice",
                    &chat.id,
                    ChatMessage::user(format!("q{n}")),
                    ChatMessage::assistant(format!("a{n}")),
                )
                .await
                .expect("append");
        }

        assert!(matches!(
            store.truncate_messages("alice", &chat.id, 4).await,
            Err(StoreError::MessageNotFound)
        ));
        let updated = store
            .truncate_messages("alice", &chat.id, 1)
            .await
            .expect("truncate");
        assert_eq!(updated.messages.len(), 1);
        assert_eq!(updated.messages[0].content, "q0");
        let updated = store
            .truncate_messages("alice", &chat.id, 0)
            .await
            .expect("truncate all");
        assert!(updated.messages.is_empty());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_activity() {
        let base = scratch("order");
        let store = ChatStore::new(&base).await.expect("store");
        let older = store.create_chat("alice", Some("older")).await.expect("older");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = store.create_chat("alice", Some("newer")).await.expect("newer");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append_exchange(
                "alice",
                &older.id,
                ChatMessage::user("bump"),
                ChatMessage::assistant("ok"),
            )
            .await
            .expect("append");

        let ids = store
            .list_chats("alice")
            .await
            .into_iter()
            .map(|c| c.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![older.id, newer.id]);
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let base = scratch("corrupt");
        stdfs::create_dir_all(&base).expect("dir");
        stdfs::write(base.join(CHATS_FILE), "{not json").expect("write");
        let store = ChatStore::new(&base).await.expect("store");
        assert!(store.list_chats("alice").await.is_empty());
        let _ = stdfs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn imports_legacy_saved_chats_once() {
        let base = scratch("legacy");
        stdfs::create_dir_all(&base).expect("dir");
        let legacy_path = base.join("saved_chats.json");
        stdfs::write(
            &legacy_path,
            r#"{
  "20240101_120000": {
    "title": "Old chat",
    "created_at": "2024-01-01T12:00:00.123456",
    "messages": [
      {"role": "user", "content": "hi", "timestamp": "2024-01-01T12:00:01.000001"},
      {"role": "assistant", "content": "hello", "timestamp": "2024-01-01T12:00:02"}
    ]
  },
  "20240102_090000": {"messages": []}
}"#,
        )
        .expect("legacy write");

        let store = ChatStore::new(base.join("state")).await.expect("store");
        let counts = store
            .import_legacy_file(&legacy_path, "alice")
            .await
            .expect("import");
        assert_eq!(
            counts,
            LegacyImportCounts {
                chats: 2,
                messages: 2,
                skipped: 0
            }
        );

        let chat = store
            .get_chat("alice", "20240101_120000")
            .await
            .expect("imported chat");
        assert_eq!(chat.title, "Old chat");
        assert_eq!(chat.messages[1].role, MessageRole::Assistant);
        assert_eq!(chat.updated_at.to_rfc3339(), "2024-01-01T12:00:02+00:00");
        let untitled = store
            .get_chat("alice", "20240102_090000")
            .await
            .expect("untitled chat");
        assert_eq!(untitled.title, "Chat 2");

        let again = store
            .import_legacy_file(&legacy_path, "alice")
            .await
            .expect("reimport");
        assert_eq!(again.chats, 0);
        assert_eq!(again.skipped, 2);
        let _ = stdfs::remove_dir_all(&base);
    }
}
