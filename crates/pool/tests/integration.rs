//! End-to-end: a real [`cpool_worker::run_on`] dispatch loop wired to a
//! [`Pool`] through an in-memory duplex, exercising the invariants spec §8
//! assigns to this crate: identity-based state-sync cache hits (no
//! redundant resend) and in-transaction worker stickiness.

use std::sync::Arc;

use cpool_pool::{Pool, Request, TxRequest, WantedState, WorkerView};
use cpool_proto::{Blob, StateId};
use cpool_worker::StubCompiler;

async fn spawn_worker() -> Arc<WorkerView> {
	let (pool_half, worker_half) = tokio::io::duplex(64 * 1024);
	let (worker_read, worker_write) = tokio::io::split(worker_half);
	tokio::spawn(cpool_worker::run_on(worker_read, worker_write, StubCompiler));

	let (mut pool_read, pool_write) = tokio::io::split(pool_half);
	let pid = cpool_transport::read_handshake(&mut pool_read).await.unwrap();
	let client = cpool_transport::Client::with_defaults(pool_read, pool_write);
	Arc::new(WorkerView::new(pid, client))
}

#[tokio::test]
async fn plain_compile_round_trips_through_a_real_worker() {
	let pool = Pool::new();
	pool.register_worker(spawn_worker().await);

	let req = Request {
		dbname: Some("d".to_string()),
		wanted: WantedState {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		},
		args: Blob::new(b"SELECT 1".to_vec()),
	};
	let reply = pool.compile(req).await.unwrap();
	assert_eq!(reply.bytes(), b"SELECT 1");
	assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn second_call_with_identical_blobs_omits_the_resend() {
	let pool = Pool::new();
	pool.register_worker(spawn_worker().await);

	let user = Blob::new(b"u".to_vec());
	let refl = Blob::new(b"r".to_vec());
	let cfg = Blob::new(b"c".to_vec());

	let first = Request {
		dbname: Some("d".to_string()),
		wanted: WantedState {
			user_schema_pickle: Some(user.clone()),
			reflection_cache: Some(refl.clone()),
			database_config: Some(cfg.clone()),
			..Default::default()
		},
		args: Blob::new(b"SELECT 1".to_vec()),
	};
	pool.compile(first).await.unwrap();

	// Same blob identities the second time: the worker's cached
	// `DatabaseState` already matches, so the preamble the pool builds is
	// all-nil and the worker serves the call purely from its own cache.
	let second = Request {
		dbname: Some("d".to_string()),
		wanted: WantedState {
			user_schema_pickle: Some(user),
			reflection_cache: Some(refl),
			database_config: Some(cfg),
			..Default::default()
		},
		args: Blob::new(b"SELECT 2".to_vec()),
	};
	let reply = pool.compile(second).await.unwrap();
	assert_eq!(reply.bytes(), b"SELECT 2");
}

#[tokio::test]
async fn transaction_stays_sticky_to_the_worker_that_holds_it() {
	let pool = Pool::new();
	pool.register_worker(spawn_worker().await);
	pool.register_worker(spawn_worker().await);

	let begin = TxRequest {
		dbname: "d".to_string(),
		wanted: WantedState {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		},
		state_id: StateId::NONE,
		state: Blob::new(Vec::new()),
		args: Blob::new(b"BEGIN".to_vec()),
	};
	let outcome = pool.compile_in_tx(begin).await.unwrap();
	assert_ne!(outcome.state_id, StateId::NONE);

	// Continuing the transaction: with two idle workers available, the
	// pool must pick the one whose `last_tx_state_id` matches, letting the
	// worker reuse its own held state rather than resending it.
	let cont = TxRequest {
		dbname: "d".to_string(),
		wanted: WantedState::default(),
		state_id: outcome.state_id,
		state: outcome.state.clone(),
		args: Blob::new(b"SELECT 1".to_vec()),
	};
	let second = pool.compile_in_tx(cont).await.unwrap();
	assert_eq!(second.result.bytes(), b"SELECT 1");
	assert_eq!(pool.idle_count(), 2);
}

#[tokio::test]
async fn stopped_pool_rejects_new_calls() {
	let pool = Pool::new();
	pool.register_worker(spawn_worker().await);
	pool.stop();

	let err = pool
		.compile(Request {
			dbname: Some("d".to_string()),
			wanted: WantedState::default(),
			args: Blob::new(Vec::new()),
		})
		.await
		.unwrap_err();
	assert!(matches!(err, cpool_pool::PoolError::PoolClosed));
}
