use chat_sync::cache::{decode_snapshot, encode_snapshot, FileMessageCache, MemoryMessageCache, MessageCache};
use chat_sync::model::{
    Attachment, ConversationId, LocationRef, MediaUrl, Message, MessageBody, MessageId, Sender, UnixTimeMs,
};
use proptest::prelude::*;

fn room() -> ConversationId {
    ConversationId::new("roundtrip")
}

/// Newest first, with a mix of every body shape.
fn messages(n: usize) -> Vec<Message> {
    (0..n)
        .rev()
        .map(|i| {
            let attachment = match i % 4 {
                0 => None,
                1 => Some(Attachment::Image {
                    url: MediaUrl::new(format!("https://cdn.example.com/images/{i}_abcdef.jpg")).unwrap(),
                }),
                2 => Some(Attachment::Audio {
                    url: MediaUrl::new(format!("https://cdn.example.com/audio/{i}_abcdef.m4a")).unwrap(),
                }),
                _ => Some(Attachment::Location(LocationRef::new(-33.868_82, 151.209_29).unwrap())),
            };
            Message {
                id: MessageId::new(format!("msg-{i}")),
                created_at: UnixTimeMs(1_700_000_000_000 + i as u64 * 37),
                sender: Sender::new(format!("u{}", i % 3), format!("User {}", i % 3)),
                body: MessageBody {
                    text: format!("message number {i}"),
                    attachment,
                },
            }
        })
        .collect()
}

async fn assert_roundtrip(cache: &dyn MessageCache, n: usize) {
    let original = messages(n);
    cache.write(&room(), &original).await.unwrap();
    let read = cache.read(&room()).await.unwrap().expect("entry present");
    assert_eq!(read, original, "roundtrip mismatch for n={n}");
}

#[tokio::test]
async fn memory_cache_roundtrip_sizes() {
    let cache = MemoryMessageCache::default();
    for n in [0, 1, 500] {
        assert_roundtrip(&cache, n).await;
    }
}

#[tokio::test]
async fn file_cache_roundtrip_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FileMessageCache::new(dir.path()).unwrap();
    for n in [0, 1, 500] {
        assert_roundtrip(&cache, n).await;
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
#[tokio::test]
async fn sqlite_cache_roundtrip_sizes() {
    let cache = chat_sync::cache::SqliteMessageCache::open_in_memory().unwrap();
    for n in [0, 1, 500] {
        assert_roundtrip(&cache, n).await;
    }
}

fn attachment_strategy() -> impl Strategy<Value = Option<Attachment>> {
    prop_oneof![
        Just(None),
        "[a-z0-9]{1,16}".prop_map(|name| Some(Attachment::Image {
            url: MediaUrl::new(format!("https://cdn.example.com/images/{name}.jpg")).unwrap(),
        })),
        "[a-z0-9]{1,16}".prop_map(|name| Some(Attachment::Audio {
            url: MediaUrl::new(format!("https://cdn.example.com/audio/{name}.m4a")).unwrap(),
        })),
        (-90.0f64..=90.0, -180.0f64..=180.0)
            .prop_map(|(lat, lon)| Some(Attachment::Location(LocationRef::new(lat, lon).unwrap()))),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        "[a-zA-Z0-9_-]{1,24}",
        any::<u64>(),
        "[a-z0-9]{1,8}",
        ".{0,32}",
        ".{0,64}",
        attachment_strategy(),
    )
        .prop_map(|(id, ts, user, name, text, attachment)| Message {
            id: MessageId::new(id),
            created_at: UnixTimeMs(ts),
            sender: Sender::new(user, name),
            body: MessageBody { text, attachment },
        })
}

proptest! {
    #[test]
    fn envelope_roundtrip_is_exact(list in proptest::collection::vec(message_strategy(), 0..40)) {
        let bytes = encode_snapshot(&room(), &list).unwrap();
        let decoded = decode_snapshot(&room(), &bytes).unwrap();
        prop_assert_eq!(decoded, list);
    }

    #[test]
    fn single_bit_flip_never_yields_a_different_list(
        list in proptest::collection::vec(message_strategy(), 1..8),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut bytes = encode_snapshot(&room(), &list).unwrap();
        let i = position.index(bytes.len());
        bytes[i] ^= 1 << bit;

        if let Ok(decoded) = decode_snapshot(&room(), &bytes) {
            prop_assert_eq!(decoded, list);
        }
    }
}
