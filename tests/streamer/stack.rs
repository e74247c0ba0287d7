use std::sync::Arc;

use streamstack::common::exception::AssemblyError;
use streamstack::streamer::config::StreamerConfig;
use streamstack::streamer::context::StreamerContext;
use streamstack::streamer::request::RequestBuilder;
use streamstack::streamer::request_status::RequestStatus;
use streamstack::streamer::scheduler::Scheduler;
use streamstack::streamer::stack::StreamStack;
use streamstack::streamer::stage::stage_ref;

use crate::common::logger::init_test_logger;
use crate::common::stages::{DecliningStage, ResolvingStage, stage_names, trace};
use crate::{assert_err, assert_ok};

#[test]
fn nested_stack_runs_as_one_stage() {
    init_test_logger();
    let trace = trace();
    let inner = assert_ok!(StreamStack::new(
        "inner",
        vec![
            stage_ref(DecliningStage::new("inner-a", &trace)),
            stage_ref(DecliningStage::new("inner-b", &trace)),
        ],
    ));
    let (resolver, _) = ResolvingStage::new("device", 2, &trace);
    let outer = assert_ok!(StreamStack::new(
        "outer",
        vec![
            stage_ref(DecliningStage::new("front", &trace)),
            stage_ref(inner),
            stage_ref(resolver),
        ],
    ));
    assert_eq!(outer.len(), 3);

    let mut scheduler = assert_ok!(Scheduler::new(
        outer,
        Arc::new(StreamerContext::default()),
        StreamerConfig::default()
    ));
    let handle = scheduler.context().submit(RequestBuilder::file_exists("x"));
    assert!(scheduler.run_until_idle(10));

    assert_eq!(handle.status(), RequestStatus::Completed);
    assert_eq!(
        stage_names(&trace),
        vec!["front", "inner-a", "inner-b", "device"]
    );
}

#[test]
fn assembly_errors() {
    init_test_logger();
    let trace = trace();
    let err = assert_err!(StreamStack::new("empty", Vec::new()));
    assert_eq!(err, AssemblyError::EmptyStack("empty".to_string()));

    let err = assert_err!(StreamStack::new(
        "dupes",
        vec![
            stage_ref(DecliningStage::new("same", &trace)),
            stage_ref(DecliningStage::new("same", &trace)),
        ],
    ));
    assert_eq!(err, AssemblyError::DuplicateName("same".to_string()));
}

#[test]
fn stages_can_be_rebound_between_ticks() {
    init_test_logger();
    let trace = trace();
    let (resolver, _) = ResolvingStage::new("device", 2, &trace);
    let stack = assert_ok!(StreamStack::new("rebind", vec![stage_ref(resolver)]));
    let mut scheduler = assert_ok!(Scheduler::new(
        stack,
        Arc::new(StreamerContext::default()),
        StreamerConfig::default()
    ));

    let first = scheduler.context().submit(RequestBuilder::file_exists("x"));
    assert!(scheduler.run_until_idle(10));
    assert_eq!(first.status(), RequestStatus::Completed);

    let stack = scheduler.stack_mut();
    assert_ok!(stack.push_back(stage_ref(DecliningStage::new("tail", &trace))));
    let tail = stack.find("tail").unwrap();
    assert!(tail.lock().link().context().is_some());
    assert_eq!(stack.stage_names(), vec!["device", "tail"]);

    let removed = assert_ok!(stack.remove("tail"));
    assert_eq!(removed.lock().name(), "tail");
    assert_eq!(stack.stage_names(), vec!["device"]);
}
