#![allow(dead_code)]

use chainstage::BackendTransaction;
use chainstage::prelude::*;
use std::sync::Arc;

/// Author 1-N Post, Post N-1 Author (non-nullable), Post N-1 Post `reply_to`.
pub fn blog_schema() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Post")
                    .required("title", DataType::Text)
                    .column("likes", DataType::Integer)
                    .relation(RelationDef::many_to_one("author", "Author").not_null())
                    .relation(RelationDef::many_to_one("reply_to", "Post")),
            )
            .entity(
                EntityTypeDef::new("Author")
                    .required("name", DataType::Text)
                    .relation(RelationDef::one_to_many("posts", "Post", "author")),
            )
            .build()
            .expect("blog schema"),
    )
}

/// Linked list of blocks through a non-nullable self reference.
pub fn ledger_schema() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::builder()
            .entity(
                EntityTypeDef::new("Account")
                    .required("balance", DataType::Integer),
            )
            .entity(
                EntityTypeDef::new("Transfer")
                    .required("amount", DataType::Integer)
                    .required("block", DataType::Integer)
                    .relation(RelationDef::many_to_one("from", "Account").not_null())
                    .relation(RelationDef::many_to_one("to", "Account").not_null()),
            )
            .entity(
                EntityTypeDef::new("Checkpoint")
                    .required("height", DataType::Integer)
                    .relation(RelationDef::many_to_one("parent", "Checkpoint").not_null()),
            )
            .build()
            .expect("ledger schema"),
    )
}

pub fn author(id: &str, name: &str) -> Entity {
    Entity::new("Author", id).with("name", name)
}

pub fn post(id: &str, title: &str, author_id: &str) -> Entity {
    Entity::new("Post", id)
        .with("title", title)
        .with_ref("author", "Author", author_id)
}

pub fn block(height: i64) -> BlockRef {
    BlockRef::new(height, format!("0x{:04x}", height))
}

/// Block at `height` on an alternative fork.
pub fn fork_block(height: i64) -> BlockRef {
    BlockRef::new(height, format!("0xf{:03x}", height))
}

pub fn genesis_parent() -> BlockRef {
    BlockRef::new(-1, "0x")
}

/// Store over a fresh transaction; the handle is returned for commit.
pub async fn open_store(
    backend: &MemoryBackend,
    config: StoreConfig,
) -> (Arc<dyn BackendTransaction>, Store) {
    let tx = backend
        .begin(IsolationLevel::Serializable)
        .await
        .expect("begin");
    let store = Store::new(backend.schema().clone(), Arc::clone(&tx), config);
    (tx, store)
}

/// Commits `rows` in one transaction and forgets the journal it produced.
pub async fn seed(backend: &MemoryBackend, rows: Vec<Entity>) -> Result<()> {
    let (tx, store) = open_store(backend, StoreConfig::default()).await;
    for row in rows {
        store.insert(row).await?;
    }
    store.flush().await?;
    tx.commit().await?;
    backend.clear_journal();
    Ok(())
}

pub async fn connected_manager(
    schema: Arc<SchemaRegistry>,
) -> (MemoryBackend, ChainTransactionManager) {
    let backend = MemoryBackend::new(schema.clone());
    let manager = ChainTransactionManager::new(
        Arc::new(backend.clone()),
        schema,
        ChainConfig::new().backoff_ms(0, 0),
    )
    .expect("manager");
    manager.connect().await.expect("connect");
    (backend, manager)
}
