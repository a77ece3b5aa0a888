use chainstage::backend::JournalEntry;
use chainstage::prelude::*;
use chainstage::FlushMode;
use tokio_test::{assert_err, assert_ok};

mod fixtures;
use fixtures::*;

fn entry(kind: &str, entity: &str, ids: &[&str]) -> JournalEntry {
    let entity = entity.to_string();
    let ids = ids.iter().map(|id| id.to_string()).collect();
    match kind {
        "insert" => JournalEntry::Insert { entity, ids },
        "upsert" => JournalEntry::Upsert { entity, ids },
        _ => JournalEntry::Delete { entity, ids },
    }
}

#[tokio::test]
async fn test_writes_follow_commit_order_and_reads_hit_cache() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (tx, store) = open_store(&backend, StoreConfig::default()).await;

    // 1. Posts first, their author last
    store.insert(post("p1", "Hello", "a1")).await?;
    store.insert(post("p2", "Again", "a1")).await?;
    store.insert(author("a1", "Ada")).await?;
    assert_eq!(store.pending_changes().await, 3);

    // 2. A read syncs, authors reach the transaction before posts
    let loaded = store
        .get_or_fail_with("Post", "p1", &RelationMask::new().with("author"))
        .await?;
    assert_eq!(
        backend.journal(),
        vec![
            entry("insert", "Author", &["a1"]),
            entry("insert", "Post", &["p1", "p2"]),
        ]
    );

    // 3. Served from the cache: nothing was queried
    assert_eq!(backend.total_find_calls(), 0);
    assert_eq!(loaded.field("title"), Some(&Value::from("Hello")));
    assert_eq!(
        loaded.related("author").and_then(|a| a.field("name")),
        Some(&Value::from("Ada"))
    );

    // 4. Count goes to the database and sees the synced rows
    assert_eq!(store.count("Post", &[Filter::eq("author", "a1")]).await?, 2);

    store.flush().await?;
    tx.commit().await?;
    assert_eq!(backend.rows("Post").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_self_reference_chain_is_written_in_passes() -> Result<()> {
    let backend = MemoryBackend::new(ledger_schema());
    let (tx, store) = open_store(&backend, StoreConfig::new().flush_mode(FlushMode::Batch)).await;

    // 1. Children before parents; the root points at itself
    store
        .insert(
            Entity::new("Checkpoint", "x")
                .with("height", 3)
                .with_ref("parent", "Checkpoint", "y"),
        )
        .await?;
    store
        .insert(
            Entity::new("Checkpoint", "y")
                .with("height", 2)
                .with_ref("parent", "Checkpoint", "z"),
        )
        .await?;
    store
        .insert(
            Entity::new("Checkpoint", "z")
                .with("height", 1)
                .with_ref("parent", "Checkpoint", "z"),
        )
        .await?;

    // 2. Each pass writes what its parent allows
    store.sync().await?;
    assert_eq!(
        backend.journal(),
        vec![
            entry("insert", "Checkpoint", &["z"]),
            entry("insert", "Checkpoint", &["y"]),
            entry("insert", "Checkpoint", &["x"]),
        ]
    );

    tx.commit().await?;
    let x = backend.row("Checkpoint", "x").await?.expect("x stored");
    assert_eq!(x.ref_id("parent"), Some(Some("y")));
    Ok(())
}

#[tokio::test]
async fn test_insert_referencing_new_upsert_waits_for_it() -> Result<()> {
    let backend = MemoryBackend::new(ledger_schema());
    let (tx, store) = open_store(&backend, StoreConfig::new().flush_mode(FlushMode::Batch)).await;

    // 1. A new root arrives as an upsert, its child as an insert
    store
        .upsert(
            Entity::new("Checkpoint", "root")
                .with("height", 0)
                .with_ref("parent", "Checkpoint", "root"),
        )
        .await?;
    store
        .insert(
            Entity::new("Checkpoint", "child")
                .with("height", 1)
                .with_ref("parent", "Checkpoint", "root"),
        )
        .await?;

    // 2. The root is written before the row pointing at it
    assert_ok!(store.sync().await);
    assert_eq!(
        backend.journal(),
        vec![
            entry("upsert", "Checkpoint", &["root"]),
            entry("insert", "Checkpoint", &["child"]),
        ]
    );

    tx.commit().await?;
    let child = backend.row("Checkpoint", "child").await?.expect("child stored");
    assert_eq!(child.ref_id("parent"), Some(Some("root")));
    Ok(())
}

#[tokio::test]
async fn test_nullable_self_reference_is_patched() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    seed(&backend, vec![author("a1", "Ada")]).await?;
    let (tx, store) = open_store(&backend, StoreConfig::default()).await;

    // 1. The reply is staged before the post it answers
    store
        .insert(post("p2", "Re: Hello", "a1").with_ref("reply_to", "Post", "p1"))
        .await?;
    store.insert(post("p1", "Hello", "a1")).await?;
    store.flush().await?;

    // 2. The reference is written by a trailing upsert
    assert_eq!(
        backend.journal(),
        vec![
            entry("insert", "Post", &["p2", "p1"]),
            entry("upsert", "Post", &["p2"]),
        ]
    );
    tx.commit().await?;

    let reply = backend.row("Post", "p2").await?.expect("reply stored");
    assert_eq!(reply.ref_id("reply_to"), Some(Some("p1")));
    assert_eq!(reply.field("title"), Some(&Value::from("Re: Hello")));
    Ok(())
}

#[tokio::test]
async fn test_delete_then_insert_becomes_upsert() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    seed(
        &backend,
        vec![author("a1", "Ada"), post("p1", "Draft", "a1").with("likes", 3)],
    )
    .await?;
    let (tx, store) = open_store(&backend, StoreConfig::new().flush_mode(FlushMode::Batch)).await;

    // 1. Delete and re-create in the same unit of work
    store.delete_by_id("Post", "p1").await?;
    assert!(store.get("Post", "p1").await?.is_none());
    store.insert(post("p1", "Final", "a1")).await?;
    store.flush().await?;

    // 2. Only an upsert reaches the backend, absent columns are NULL
    assert_eq!(backend.journal(), vec![entry("upsert", "Post", &["p1"])]);
    tx.commit().await?;
    let row = backend.row("Post", "p1").await?.expect("p1 stored");
    assert_eq!(row.field("title"), Some(&Value::from("Final")));
    assert_eq!(row.field("likes"), Some(&Value::Null));
    Ok(())
}

#[tokio::test]
async fn test_insert_then_delete_never_reaches_backend() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::default()).await;

    store.insert(author("a1", "Ada")).await?;
    store.delete(&author("a1", "Ada")).await?;
    assert_eq!(store.pending_changes().await, 0);

    // Known missing: answered without a query
    assert!(store.get("Author", "a1").await?.is_none());
    store.flush().await?;

    assert!(backend.journal().is_empty());
    assert_eq!(backend.total_find_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_insert_is_rejected() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::new().flush_mode(FlushMode::Batch)).await;

    assert_ok!(store.insert(author("a1", "Ada")).await);
    let res = store.insert(author("a1", "Ada")).await;
    match res {
        Err(StoreError::DuplicateInsert { ref entity, ref id }) => {
            assert_eq!(entity, "Author");
            assert_eq!(id, "a1");
        }
        _ => panic!("Expected DuplicateInsert, got {:?}", res),
    }

    // Upserting a pending insert keeps it an insert
    assert_ok!(store.upsert(author("a1", "Ada L.")).await);
    store.sync().await?;
    assert_eq!(backend.journal(), vec![entry("insert", "Author", &["a1"])]);
    Ok(())
}

#[tokio::test]
async fn test_always_mode_writes_immediately() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::new().flush_mode(FlushMode::Always)).await;

    store.insert(author("a1", "Ada")).await?;
    assert_eq!(backend.journal(), vec![entry("insert", "Author", &["a1"])]);
    assert_eq!(store.pending_changes().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_find_with_filters_order_and_relations() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    seed(
        &backend,
        vec![
            author("a1", "Ada"),
            author("a2", "Grace"),
            post("p1", "One", "a1").with("likes", 5),
            post("p2", "Two", "a1").with("likes", 9),
            post("p3", "Three", "a2").with("likes", 1),
        ],
    )
    .await?;
    let (_tx, store) = open_store(&backend, StoreConfig::default()).await;

    // 1. Owning relation loaded, ordered by a column
    let options = FindOptions::new()
        .filter(Filter::eq("author", "a1"))
        .order_by(OrderBy::desc("likes"))
        .relations(RelationMask::new().with("author"));
    let posts = store.find("Post", &options).await?;
    let ids: Vec<&str> = posts.iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec!["p2", "p1"]);
    assert_eq!(posts[0].related("author").map(|a| a.id()), Some("a1"));

    // 2. Inverse relation collects every post of the author
    let ada = store
        .find_one_or_fail(
            "Author",
            &FindOptions::new()
                .filter(Filter::eq("id", "a1"))
                .relations(RelationMask::new().with("posts")),
        )
        .await?;
    assert_eq!(ada.related_many("posts").map(|p| p.len()), Some(2));

    // 3. Skip / take
    let page = store
        .find(
            "Post",
            &FindOptions::new()
                .order_by(OrderBy::asc("likes"))
                .skip(1)
                .take(1),
        )
        .await?;
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id(), "p1");

    // 4. Results populated the cache: p1 needs no query, p3 does
    let before = backend.find_calls("Post");
    let p1 = store.get_or_fail("Post", "p1").await?;
    assert_eq!(p1.field("likes"), Some(&Value::Integer(5)));
    assert_eq!(backend.find_calls("Post"), before);
    assert!(store.get("Post", "p3").await?.is_some());
    assert_eq!(backend.find_calls("Post"), before + 1);
    Ok(())
}

#[tokio::test]
async fn test_find_one_or_fail_reports_missing_id() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::default()).await;

    let res = store
        .find_one_or_fail("Author", &FindOptions::new().filter(Filter::eq("id", "ghost")))
        .await;
    match res {
        Err(StoreError::NotFound { ref entity, ref id }) => {
            assert_eq!(entity, "Author");
            assert_eq!(id, "ghost");
        }
        _ => panic!("Expected NotFound, got {:?}", res),
    }

    let err = assert_err!(store.get_or_fail("Post", "nope").await);
    assert!(matches!(err, StoreError::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_deferred_lookups_share_batches() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let authors = (0..5).map(|i| author(&format!("a{}", i), "Anon")).collect();
    seed(&backend, authors).await?;
    let (_tx, store) = open_store(&backend, StoreConfig::new().defer_batch_size(2)).await;

    // 1. Six handles, one of them for a missing row
    let mut handles = Vec::new();
    for i in 0..6 {
        handles.push(store.defer("Author", &format!("a{}", i), RelationMask::new()).await?);
    }

    // 2. The first read resolves everything: ceil(6 / 2) queries
    assert!(handles[0].get().await?.is_some());
    assert_eq!(backend.find_calls("Author"), 3);

    // 3. Remaining handles are served from the cache
    for handle in &handles[1..5] {
        assert_eq!(handle.get_or_fail().await?.id(), handle.id());
    }
    assert!(handles[5].get().await?.is_none());
    assert_eq!(backend.find_calls("Author"), 3);

    // 4. A missing deferred row can be created on demand
    let created = handles[5]
        .get_or_insert(|id| author(id, "Late"))
        .await?;
    assert_eq!(created.field("name"), Some(&Value::from("Late")));
    assert_eq!(store.pending_changes().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_get_or_insert_rejects_foreign_identity() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::default()).await;

    let res = store
        .get_or_insert("Author", "a1", |_| author("a2", "Wrong"))
        .await;
    match res {
        Err(StoreError::InvalidUsage(_)) => {}
        _ => panic!("Expected InvalidUsage, got {:?}", res),
    }

    let ada = store.get_or_insert("Author", "a1", |id| author(id, "Ada")).await?;
    assert_eq!(ada.id(), "a1");
    Ok(())
}

#[tokio::test]
async fn test_unknown_names_are_rejected() -> Result<()> {
    let backend = MemoryBackend::new(blog_schema());
    let (_tx, store) = open_store(&backend, StoreConfig::default()).await;

    let res = store.insert(Entity::new("Comment", "c1")).await;
    assert!(matches!(res, Err(StoreError::UnknownEntity(_))), "got {:?}", res);

    let res = store.insert(author("a1", "Ada").with("age", 36)).await;
    match res {
        Err(StoreError::UnknownField { ref field, .. }) => assert_eq!(field, "age"),
        _ => panic!("Expected UnknownField, got {:?}", res),
    }
    Ok(())
}
