mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, eventually, task_record, FakeCanvas};
use paintboard_core::board::Board;
use paintboard_core::error::TaskError;
use paintboard_core::model::Pos;
use paintboard_core::task::TaskTracker;

fn start(canvas: &Arc<FakeCanvas>, width: usize, height: usize, record: paintboard_core::model::TaskRecord) -> (Arc<Board>, Arc<TaskTracker>) {
    let config = config(width, height);
    let board = Board::new(canvas.clone(), &config);
    let tracker = TaskTracker::new(record, &config).unwrap();
    tracker.spawn(board.clone(), Duration::from_millis(20));
    (board, tracker)
}

#[tokio::test]
async fn test_single_cell_task_converges() {
    let canvas = FakeCanvas::new(1, 1, 0);
    let (_board, tracker) = start(&canvas, 1, 1, task_record("t", "alice", (0, 0), 1, "3"));

    eventually("tracker to attach", || tracker.is_working()).await;
    assert_eq!(tracker.pending_len(), 1);
    assert_eq!(tracker.weight(), 1.0);
    assert_eq!(tracker.find(|_| true), Some(Pos::new(0, 0)));
    assert_eq!(tracker.target(Pos::new(0, 0)), Some(3));

    canvas.paint(0, 0, 3).await;
    eventually("cell to resolve", || tracker.find(|_| true).is_none()).await;
    assert_eq!(tracker.pending_len(), 0);
    assert_eq!(tracker.weight(), 0.0);
}

#[tokio::test]
async fn test_disturbed_cell_is_requeued() {
    let canvas = FakeCanvas::new(3, 1, 1);
    let (_board, tracker) = start(&canvas, 3, 1, task_record("t", "alice", (1, 0), 2, "11"));

    eventually("tracker to attach", || tracker.is_working()).await;
    assert_eq!(tracker.pending_len(), 0);

    canvas.paint(0, 0, 5).await;
    canvas.paint(2, 0, 5).await;
    eventually("disturbed cell to be pending", || tracker.pending_len() == 1).await;
    assert_eq!(tracker.find(|_| true), Some(Pos::new(2, 0)));

    canvas.paint(2, 0, 1).await;
    eventually("cell to resolve again", || tracker.find(|_| true).is_none()).await;
}

#[tokio::test]
async fn test_find_keeps_rejected_cells_pending() {
    let canvas = FakeCanvas::new(2, 2, 0);
    let (_board, tracker) = start(&canvas, 2, 2, task_record("t", "alice", (0, 0), 2, "1111"));
    eventually("tracker to attach", || tracker.is_working()).await;

    assert_eq!(tracker.find(|_| false), None);
    assert_eq!(tracker.pending_len(), 4);

    let skip = Pos::new(1, 1);
    for _ in 0..20 {
        let found = tracker.find(|pos| pos != skip).unwrap();
        assert_ne!(found, skip);
    }
    assert_eq!(tracker.pending_len(), 4);
}

#[tokio::test]
async fn test_transparent_cells_are_ignored() {
    let canvas = FakeCanvas::new(2, 1, 0);
    let (_board, tracker) = start(&canvas, 2, 1, task_record("t", "alice", (0, 0), 2, "1."));
    eventually("tracker to attach", || tracker.is_working()).await;

    assert_eq!(tracker.pending_len(), 1);
    assert!(tracker.contains(Pos::new(1, 0)));
    assert_eq!(tracker.target(Pos::new(1, 0)), None);

    canvas.paint(1, 0, 7).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tracker.pending_len(), 1);
}

#[tokio::test]
async fn test_reconnect_recomputes_pending() {
    let canvas = FakeCanvas::new(2, 1, 1);
    let (board, tracker) = start(&canvas, 2, 1, task_record("t", "alice", (0, 0), 2, "11"));
    eventually("tracker to attach", || tracker.is_working()).await;
    let first = board.view().unwrap().generation();
    assert_eq!(tracker.pending_len(), 0);

    // Changed while nobody was listening.
    canvas.set_cell(1, 0, 0);
    canvas.drop_live_feed();

    eventually("tracker to reattach on a new generation", || {
        board.view().map(|v| v.generation() > first).unwrap_or(false)
            && tracker.is_working()
            && tracker.pending_len() == 1
    })
    .await;
    assert_eq!(tracker.find(|_| true), Some(Pos::new(1, 0)));
}

#[tokio::test]
async fn test_destroy_stops_tracking() {
    let canvas = FakeCanvas::new(1, 1, 0);
    let config = config(1, 1);
    let board = Board::new(canvas.clone(), &config);
    let tracker = TaskTracker::new(task_record("t", "alice", (0, 0), 1, "2"), &config).unwrap();
    let handle = tracker.spawn(board, Duration::from_millis(20));
    eventually("tracker to attach", || tracker.is_working()).await;

    tracker.destroy();
    handle.await.unwrap();
    assert!(!tracker.is_working());
    assert_eq!(tracker.find(|_| true), None);
}

#[test]
fn test_placement_must_fit_the_canvas() {
    let config = config(4, 4);
    let err = TaskTracker::new(task_record("t", "alice", (3, 0), 2, "1111"), &config).unwrap_err();
    assert!(matches!(err, TaskError::OutOfBounds { left: 3, .. }));

    let mut record = task_record("t", "alice", (0, 0), 2, "1111");
    record.options.weight = -1.0;
    assert!(matches!(
        TaskTracker::new(record, &config),
        Err(TaskError::InvalidWeight(_))
    ));

    let err = TaskTracker::new(task_record("t", "alice", (0, 0), 2, "11z1"), &config).unwrap_err();
    assert!(matches!(err, TaskError::Image(_)));
}
