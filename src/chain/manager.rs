// ============================================================================
// Chain Transaction Manager
// ============================================================================
//
// Drives block-range transactions against the persisted status row:
//
//   transact      finalized-only: status must equal prev_head, hot blocks
//                 are rolled back, writer runs, status moves to next_head
//   transact_hot  new blocks on top of base_head: stale hot blocks beyond
//                 base are rolled back, finalized blocks are written plain,
//                 the rest become hot blocks with change logging
//
// Every status move is guarded by the nonce read at the start of the
// transaction. A mismatch anywhere is a `Race`; serialization failures
// retry the whole transaction.
//
// ============================================================================

use super::change_log::{HotChangeRecorder, rollback_block};
use super::config::ChainConfig;
use super::state::{BlockRef, ChainState, FinalTxInfo, HotTxInfo};
use crate::backend::{BackendTransaction, PersistenceBackend};
use crate::core::error::ensure_invariant;
use crate::core::{Result, StoreError};
use crate::schema::SchemaRegistry;
use crate::store::Store;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

pub struct ChainTransactionManager {
    backend: Arc<dyn PersistenceBackend>,
    schema: Arc<SchemaRegistry>,
    config: ChainConfig,
    state: Mutex<Option<ChainState>>,
}

impl ChainTransactionManager {
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        schema: Arc<SchemaRegistry>,
        config: ChainConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            schema,
            config,
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Loads (creating if needed) the persisted status and hot blocks.
    pub async fn connect(&self) -> Result<ChainState> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Err(StoreError::InvalidUsage("already connected".to_string()));
        }

        let tx = self.backend.begin(self.config.isolation_level).await?;
        let loaded = self.load_state(&tx).await;
        let state = finish(tx, loaded).await?;

        if !self.config.support_hot_blocks && !state.top.is_empty() {
            return Err(StoreError::Invariant(format!(
                "{} hot blocks are persisted but hot block support is disabled",
                state.top.len()
            )));
        }

        event!(
            Level::INFO,
            height = state.height,
            hash = %state.hash,
            hot_blocks = state.top.len(),
            "chain state loaded"
        );
        *guard = Some(state.clone());
        Ok(state)
    }

    pub async fn disconnect(&self) {
        *self.state.lock().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Last committed chain state.
    pub async fn state(&self) -> Result<ChainState> {
        self.state.lock().await.clone().ok_or_else(not_connected)
    }

    /// Applies a finalized block range in one transaction.
    pub async fn transact<W>(&self, info: FinalTxInfo, mut writer: W) -> Result<()>
    where
        W: for<'a> FnMut(&'a Store) -> BoxFuture<'a, Result<()>> + Send,
    {
        ensure_invariant(info.next_head.height >= info.prev_head.height, || {
            format!(
                "next head {} is below previous head {}",
                info.next_head, info.prev_head
            )
        })?;
        self.ensure_connected().await?;

        let span = info_span!("transact", prev = %info.prev_head, next = %info.next_head);
        async {
            let mut attempt = 1;
            loop {
                let tx = self.backend.begin(self.config.isolation_level).await?;
                let outcome = self.run_final(&tx, &info, &mut writer).await;
                match finish(tx, outcome).await {
                    Ok(state) => return self.publish(state).await,
                    Err(err) if self.config.should_retry(attempt, &err) => {
                        self.backoff(attempt, &err).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Applies `new_blocks` on top of `base_head` and moves finality to
    /// `finalized_head`, in one transaction.
    pub async fn transact_hot<W>(&self, info: HotTxInfo, mut writer: W) -> Result<()>
    where
        W: for<'a> FnMut(&'a Store, &'a [BlockRef]) -> BoxFuture<'a, Result<()>> + Send,
    {
        if !self.config.support_hot_blocks {
            return Err(StoreError::InvalidUsage(
                "hot blocks are not supported by this manager".to_string(),
            ));
        }
        info.validate()?;
        self.ensure_connected().await?;

        let span = info_span!(
            "transact_hot",
            base = %info.base_head,
            blocks = info.new_blocks.len(),
            finalized = %info.finalized_head
        );
        async {
            let mut attempt = 1;
            loop {
                let tx = self.backend.begin(self.config.isolation_level).await?;
                let outcome = self.run_hot(&tx, &info, &mut writer).await;
                match finish(tx, outcome).await {
                    Ok(state) => return self.publish(state).await,
                    Err(err) if self.config.should_retry(attempt, &err) => {
                        self.backoff(attempt, &err).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_final<W>(
        &self,
        tx: &Arc<dyn BackendTransaction>,
        info: &FinalTxInfo,
        writer: &mut W,
    ) -> Result<ChainState>
    where
        W: for<'a> FnMut(&'a Store) -> BoxFuture<'a, Result<()>> + Send,
    {
        let state = self.load_state(tx).await?;
        if state.finalized_head() != info.prev_head {
            return Err(StoreError::Race(format!(
                "expected to be at {}, but found {}",
                info.prev_head,
                state.finalized_head()
            )));
        }

        for block in state.top.iter().rev() {
            rollback_block(tx.as_ref(), &self.schema, block).await?;
        }

        let store = self.open_store(Arc::clone(tx));
        let written = writer(&store).await;
        complete_updates(&store, written).await?;

        self.advance_status(tx, &state, &info.next_head).await?;
        Ok(ChainState {
            height: info.next_head.height,
            hash: info.next_head.hash.clone(),
            nonce: state.nonce + 1,
            top: Vec::new(),
        })
    }

    async fn run_hot<W>(
        &self,
        tx: &Arc<dyn BackendTransaction>,
        info: &HotTxInfo,
        writer: &mut W,
    ) -> Result<ChainState>
    where
        W: for<'a> FnMut(&'a Store, &'a [BlockRef]) -> BoxFuture<'a, Result<()>> + Send,
    {
        let state = self.load_state(tx).await?;
        let mut chain = Vec::with_capacity(state.top.len() + 1);
        chain.push(state.finalized_head());
        chain.extend(state.top.iter().cloned());

        let Some(base_pos) = chain.iter().position(|block| *block == info.base_head) else {
            return Err(StoreError::Race(format!(
                "base block {} is not in the current chain (finalized {}, head {})",
                info.base_head,
                chain[0],
                state.head()
            )));
        };
        if info.new_blocks.is_empty() && base_pos + 1 != chain.len() {
            return Err(StoreError::Race(format!(
                "base block {} is not the current head {}",
                info.base_head,
                state.head()
            )));
        }
        if chain[0].height > info.finalized_head.height {
            return Err(StoreError::Race(format!(
                "finalized head {} is behind the persisted one {}",
                info.finalized_head, chain[0]
            )));
        }

        let stale = chain.split_off(base_pos + 1);
        for block in stale.iter().rev() {
            rollback_block(tx.as_ref(), &self.schema, block).await?;
        }

        let finalized_end = (info.finalized_head.height - info.base_head.height)
            .clamp(0, info.new_blocks.len() as i64) as usize;
        let (finalized, hot) = info.new_blocks.split_at(finalized_end);

        if !finalized.is_empty() {
            let store = self.open_store(Arc::clone(tx));
            let written = writer(&store, finalized).await;
            complete_updates(&store, written).await?;
        }

        for block in hot {
            tx.insert_hot_block(block).await?;
            let recorder: Arc<dyn BackendTransaction> =
                Arc::new(HotChangeRecorder::new(Arc::clone(tx), block.height));
            let store = self.open_store(recorder);
            let written = writer(&store, std::slice::from_ref(block)).await;
            complete_updates(&store, written).await?;
        }

        chain.extend(info.new_blocks.iter().cloned());
        let known = chain
            .iter()
            .find(|block| block.height == info.finalized_head.height);
        ensure_invariant(known == Some(&info.finalized_head), || {
            format!(
                "finalized head {} does not match the chain ({:?})",
                info.finalized_head,
                known.map(ToString::to_string)
            )
        })?;

        tx.delete_hot_blocks(info.finalized_head.height).await?;
        self.advance_status(tx, &state, &info.finalized_head).await?;

        Ok(ChainState {
            height: info.finalized_head.height,
            hash: info.finalized_head.hash.clone(),
            nonce: state.nonce + 1,
            top: chain
                .into_iter()
                .filter(|block| block.height > info.finalized_head.height)
                .collect(),
        })
    }

    fn open_store(&self, tx: Arc<dyn BackendTransaction>) -> Store {
        Store::new(Arc::clone(&self.schema), tx, self.config.store.clone())
    }

    async fn load_state(&self, tx: &Arc<dyn BackendTransaction>) -> Result<ChainState> {
        let status = tx.ensure_status().await?;
        let top = tx.hot_blocks().await?;
        let state = ChainState::new(status, top);
        state.validate()?;
        Ok(state)
    }

    async fn advance_status(
        &self,
        tx: &Arc<dyn BackendTransaction>,
        state: &ChainState,
        head: &BlockRef,
    ) -> Result<()> {
        let updated = tx.update_status(state.nonce, head).await?;
        if updated == 0 {
            return Err(StoreError::Race(format!(
                "status nonce {} changed while moving to {}",
                state.nonce, head
            )));
        }
        Ok(())
    }

    async fn publish(&self, state: ChainState) -> Result<()> {
        event!(
            Level::INFO,
            height = state.height,
            hash = %state.hash,
            hot_blocks = state.top.len(),
            "chain status advanced"
        );
        *self.state.lock().await = Some(state);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().await.is_none() {
            return Err(not_connected());
        }
        Ok(())
    }

    async fn backoff(&self, attempt: usize, err: &StoreError) {
        let backoff_ms = self.config.retry_backoff_ms(attempt);
        event!(
            Level::WARN,
            attempt,
            max_retries = self.config.max_serialization_retries,
            backoff_ms,
            error = %err,
            "serialization failure, retrying transaction"
        );
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }
}

/// Flushes a writer's store and closes it, whatever the writer returned.
async fn complete_updates(store: &Store, written: Result<()>) -> Result<()> {
    let result = match written {
        Ok(()) => store.flush().await,
        Err(err) => Err(err),
    };
    store.close();
    result
}

fn not_connected() -> StoreError {
    StoreError::InvalidUsage("not connected".to_string())
}

/// Commits on success, rolls back on failure.
async fn finish<T>(tx: Arc<dyn BackendTransaction>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                event!(Level::WARN, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
