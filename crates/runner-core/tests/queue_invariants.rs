//! Cross-stage invariants from spec §8: a task id lives in at most one
//! stage at a time, in-flight never exceeds a stage's cap, and a
//! stage-marker call leaves the next stage's waiting list holding the
//! task exactly once.

use runner_core::model::{ConvertParams, Stage, Task, TaskStatus};
use runner_core::queue::TaskQueue;

fn task(id: &str, priority: i64) -> Task {
    Task {
        id: id.to_string(),
        source: "https://example.test/video.mp4".to_string(),
        status: TaskStatus::Waiting,
        priority,
        convert_params: ConvertParams {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            preset: "fast".into(),
            resolution: None,
        },
        download_info: None,
        convert_info: None,
        upload_info: None,
        result: None,
        error: None,
        video_duration_ms: None,
    }
}

#[test]
fn a_task_never_occupies_two_stages_at_once() {
    let mut queue = TaskQueue::new(2, 2, 2);
    queue.add(task("t1", 0));

    // Re-adding the same id while it is already waiting in download must
    // not create a second entry anywhere in the pipeline.
    queue.add(task("t1", 99));
    assert_eq!(queue.snapshot().download.waiting, 1);

    let t = queue.next_download().unwrap();
    queue.complete_download(t);
    assert_eq!(queue.snapshot().download.waiting, 0);
    assert_eq!(queue.snapshot().convert.waiting, 1);
}

#[test]
fn in_flight_never_exceeds_the_configured_cap() {
    let mut queue = TaskQueue::new(1, 1, 1);
    queue.add(task("a", 0));
    queue.add(task("b", 0));
    queue.add(task("c", 0));

    assert!(queue.next_download().is_some());
    assert!(queue.next_download().is_none());
    assert_eq!(queue.snapshot().download.in_flight, 1);
}

#[test]
fn stage_completion_places_the_task_in_the_next_waiting_list_exactly_once() {
    let mut queue = TaskQueue::new(1, 1, 1);
    queue.add(task("t1", 0));

    let downloading = queue.next_download().unwrap();
    queue.complete_download(downloading);
    assert_eq!(queue.snapshot().convert.waiting, 1);

    let converting = queue.next_convert().unwrap();
    queue.complete_convert(converting);
    assert_eq!(queue.snapshot().convert.waiting, 0);
    assert_eq!(queue.snapshot().upload.waiting, 1);

    let uploading = queue.next_upload().unwrap();
    queue.complete_upload(&uploading.id);
    assert_eq!(queue.snapshot().upload.waiting, 0);
    assert_eq!(queue.snapshot().upload.in_flight, 0);

    // The task can be re-added as a fresh pipeline run without being
    // rejected as a duplicate, since it has fully drained from the queue.
    queue.add(task("t1", 0));
    assert_eq!(queue.snapshot().download.waiting, 1);
}

#[test]
fn failure_frees_the_task_id_for_a_later_retry() {
    let mut queue = TaskQueue::new(1, 1, 1);
    queue.add(task("t1", 0));
    let t = queue.next_download().unwrap();
    queue.fail(&t.id, Stage::Download);

    assert_eq!(queue.snapshot().download.in_flight, 0);
    queue.add(task("t1", 0));
    assert_eq!(queue.snapshot().download.waiting, 1);
}

#[test]
fn equal_priority_tasks_are_never_reordered_across_capacity_pressure() {
    // Capacity pressure scenario (spec §8, scenario 4): three same-priority
    // tasks queued in order must be served download-then-convert in that
    // same order when the stage cap is 1.
    let mut queue = TaskQueue::new(1, 1, 1);
    queue.add(task("t1", 0));
    queue.add(task("t2", 0));
    queue.add(task("t3", 0));

    let first = queue.next_download().unwrap();
    assert_eq!(first.id, "t1");
    assert!(queue.next_download().is_none());

    queue.complete_download(first);
    let second = queue.next_download().unwrap();
    assert_eq!(second.id, "t2");
}

#[test]
fn higher_priority_task_added_later_still_jumps_the_line() {
    let mut queue = TaskQueue::new(1, 1, 1);
    queue.add(task("lo", 0));
    queue.add(task("hi", 100));
    assert_eq!(queue.next_download().unwrap().id, "hi");
}
