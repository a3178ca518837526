//! Database worker thread feeding dispatch-thread components

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coratools_core::config::WorkerConfig;
use coratools_core::db::{
    BackendFactory, DbBackend, DbError, DbQuery, DbQueryClient, DbRow, DbStatement,
    DbStatementClient, DbValue, DbWorker, MemoryBackend,
};
use coratools_core::{CoraError, Dispatcher, WorkerError};

const SELECT: &str = "SELECT stamp, value FROM hourly";

fn rows(count: i64) -> Vec<DbRow> {
    (0..count)
        .map(|i| vec![DbValue::Int(i), DbValue::Text(format!("v{i}"))])
        .collect()
}

fn factory(template: MemoryBackend) -> (BackendFactory, Arc<Mutex<Vec<String>>>) {
    let log = template.log();
    let factory: BackendFactory = Box::new(move || Box::new(template.clone()) as Box<dyn DbBackend>);
    (factory, log)
}

#[derive(Default)]
struct QueryRecorder {
    batches: RefCell<Vec<usize>>,
    result: RefCell<Option<Result<u64, DbError>>>,
}

impl DbQueryClient for QueryRecorder {
    fn on_records(&self, _query: &DbQuery, rows: &[DbRow]) {
        self.batches.borrow_mut().push(rows.len());
    }

    fn on_complete(&self, _query: &DbQuery, result: Result<u64, DbError>) {
        *self.result.borrow_mut() = Some(result);
    }
}

#[derive(Default)]
struct StatementRecorder {
    result: RefCell<Option<Result<u64, DbError>>>,
}

impl DbStatementClient for StatementRecorder {
    fn on_complete(&self, _statement: &DbStatement, result: Result<u64, DbError>) {
        *self.result.borrow_mut() = Some(result);
    }
}

async fn dispatch_until(dispatcher: &Dispatcher, done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), dispatcher.run_until(done))
        .await
        .expect("dispatcher saw completion in time");
}

#[tokio::test]
async fn test_query_streams_in_acknowledged_batches() {
    let (factory, log) = factory(MemoryBackend::new().with_result(SELECT, rows(5)));
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let query = DbQuery::new(&dispatcher, worker.handle());
    let client = Rc::new(QueryRecorder::default());

    let weak = Rc::downgrade(&client) as Weak<dyn DbQueryClient>;
    query.start(SELECT, weak).unwrap();
    assert!(query.is_active());
    dispatch_until(&dispatcher, || client.result.borrow().is_some()).await;

    assert_eq!(*client.batches.borrow(), vec![2, 2, 1]);
    assert_eq!(client.result.borrow().clone(), Some(Ok(5)));
    assert!(!query.is_active());
    // Housekeeping may already have closed the idle connection
    let log = log.lock().unwrap().clone();
    assert_eq!(log[..3], ["connect".to_string(), format!("query {SELECT}"), "close 1".to_string()]);
}

#[tokio::test]
async fn test_statement_reports_rows_affected() {
    let (factory, log) = factory(MemoryBackend::new());
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let statement = DbStatement::new(&dispatcher, worker.handle());
    let client = Rc::new(StatementRecorder::default());

    let weak = Rc::downgrade(&client) as Weak<dyn DbStatementClient>;
    statement.execute("DELETE FROM hourly", weak).unwrap();
    dispatch_until(&dispatcher, || client.result.borrow().is_some()).await;

    assert_eq!(client.result.borrow().clone(), Some(Ok(1)));
    assert!(log
        .lock()
        .unwrap()
        .contains(&"execute DELETE FROM hourly".to_string()));
}

#[tokio::test]
async fn test_backend_errors_are_delivered() {
    let (factory, _log) = factory(MemoryBackend::new().failing_connect(DbError::new(17, "refused")));
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let query = DbQuery::new(&dispatcher, worker.handle());
    let client = Rc::new(QueryRecorder::default());

    let weak = Rc::downgrade(&client) as Weak<dyn DbQueryClient>;
    query.start(SELECT, weak).unwrap();
    dispatch_until(&dispatcher, || client.result.borrow().is_some()).await;

    assert_eq!(
        client.result.borrow().clone(),
        Some(Err(DbError::new(17, "refused")))
    );
    assert!(client.batches.borrow().is_empty());
}

#[tokio::test]
async fn test_unacknowledged_batch_times_out() {
    let (factory, log) = factory(MemoryBackend::new().with_result(SELECT, rows(4)));
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let query = DbQuery::new(&dispatcher, worker.handle());
    let client = Rc::new(QueryRecorder::default());

    let weak = Rc::downgrade(&client) as Weak<dyn DbQueryClient>;
    query.start(SELECT, weak).unwrap();
    // Keep the dispatch thread busy past the acknowledgement timeout
    std::thread::sleep(Duration::from_millis(600));
    dispatch_until(&dispatcher, || client.result.borrow().is_some()).await;

    assert!(client.batches.borrow().is_empty(), "withdrawn batch not delivered");
    assert_eq!(client.result.borrow().clone(), Some(Err(DbError::batch_timeout())));
    assert!(log.lock().unwrap().contains(&"close 1".to_string()));
}

#[tokio::test]
async fn test_finish_silences_outstanding_work() {
    let (factory, log) = factory(MemoryBackend::new().with_result(SELECT, rows(6)));
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let query = DbQuery::new(&dispatcher, worker.handle());
    let client = Rc::new(QueryRecorder::default());

    let weak = Rc::downgrade(&client) as Weak<dyn DbQueryClient>;
    query.start(SELECT, weak).unwrap();
    query.finish();
    query.finish();
    std::thread::sleep(Duration::from_millis(300));
    dispatcher.dispatch_pending();

    assert!(client.batches.borrow().is_empty());
    assert!(client.result.borrow().is_none());
    assert!(!query.is_active());
    let log = log.lock().unwrap().clone();
    assert!(!log.iter().any(|entry| entry == "close 2"), "no second query ran");
    assert!(worker.handle().pending() == 0);
}

#[tokio::test]
async fn test_idle_connection_closed_and_reopened() {
    let (factory, log) = factory(MemoryBackend::new());
    let worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let dispatcher = Dispatcher::new();
    let statement = DbStatement::new(&dispatcher, worker.handle());
    let client = Rc::new(StatementRecorder::default());

    for _ in 0..2 {
        client.result.borrow_mut().take();
        let weak = Rc::downgrade(&client) as Weak<dyn DbStatementClient>;
        statement.execute("UPDATE hourly SET v = 0", weak).unwrap();
        dispatch_until(&dispatcher, || client.result.borrow().is_some()).await;
        std::thread::sleep(Duration::from_millis(200));
    }

    let log = log.lock().unwrap().clone();
    let connects = log.iter().filter(|entry| *entry == "connect").count();
    let disconnects = log.iter().filter(|entry| *entry == "disconnect").count();
    assert_eq!(connects, 2);
    assert!(disconnects >= 1);
}

#[test]
fn test_requests_after_shutdown_are_rejected() {
    let (factory, _log) = factory(MemoryBackend::new());
    let mut worker = DbWorker::spawn(WorkerConfig::testing(), factory).unwrap();
    let handle = worker.handle();
    worker.shutdown();

    let dispatcher = Dispatcher::new();
    let statement = DbStatement::new(&dispatcher, handle);
    let client = Rc::new(StatementRecorder::default());
    let weak = Rc::downgrade(&client) as Weak<dyn DbStatementClient>;
    assert!(matches!(
        statement.execute("DELETE FROM hourly", weak),
        Err(CoraError::Worker(WorkerError::ShutDown))
    ));
    assert!(!statement.is_active());
}

#[test]
fn test_invalid_worker_config_rejected() {
    let (factory, _log) = factory(MemoryBackend::new());
    let config = WorkerConfig {
        batch_size: 0,
        ..WorkerConfig::testing()
    };
    assert!(matches!(
        DbWorker::spawn(config, factory),
        Err(CoraError::Configuration { .. })
    ));
}
