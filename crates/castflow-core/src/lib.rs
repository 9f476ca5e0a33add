//! castflow-core
//!
//! Durable upload and job orchestration for the podcast backend.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, upload session / part ledger, task, workflow, progress, retry, decision, errors）
//! - **ports**: 抽象化レイヤー（ObjectStore, WorkflowEngine, RecordStore, UploadCompletionHook, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（session actor, upload coordinator, job store, progress, orchestrator, builder）
//! - **impls**: 実装（in-memory store / object store / engine、content-type routing）
//! - **config**: 設定（TTL、retry budget、admission、重み表）
//! - **observability**: tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
