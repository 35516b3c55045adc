use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::rc::Rc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use workdispatch::lock::WorkLock;
use workdispatch::{
    ActionError, ActionState, DispatchError, Dispatcher, FileHandle, Handle, Hash32, LockError,
    ValueHandle, from_fn,
};

type Log = Rc<RefCell<Vec<String>>>;

fn work() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("work")).unwrap();
    (temp, path)
}

fn record(log: &Log, name: &str) {
    log.borrow_mut().push(name.to_string());
}

fn executed(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// The four action pipeline used by most tests:
/// `write-text(text) -> f1`, `double(f1) -> f2`, `double(f1) -> f3`,
/// `combine(f1, f2) -> f4`.
struct Pipeline {
    dispatcher: Dispatcher,
    log: Log,
    f1: FileHandle,
    f2: FileHandle,
    f3: FileHandle,
    f4: FileHandle,
}

impl Pipeline {
    fn new(work: &Utf8Path, text: &str) -> Self {
        Self::with(Dispatcher::new(work), text)
    }

    fn with(mut dispatcher: Dispatcher, text: &str) -> Self {
        let log = Log::default();

        let text: ValueHandle<String> = dispatcher.provided(text.to_string());
        let f1 = dispatcher.output_file("f1.txt");
        let f2 = dispatcher.output_file("f2.txt");
        let f3 = dispatcher.output_file("f3.txt");
        let f4 = dispatcher.output_file("f4.txt");

        let write_text = from_fn(&[&text], &[&f1], {
            let (log, text, f1) = (log.clone(), text.clone(), f1.clone());
            move || {
                record(&log, "write-text");
                Ok(f1.write(text.get())?)
            }
        });

        let double = |name: &'static str, input: &FileHandle, output: &FileHandle| {
            from_fn(&[input], &[output], {
                let (log, input, output) = (log.clone(), input.clone(), output.clone());
                move || {
                    record(&log, name);
                    let text = input.read_to_string()?;
                    Ok(output.write(format!("{text}\n{text}"))?)
                }
            })
        };

        let combine = from_fn(&[&f1, &f2], &[&f4], {
            let (log, f1, f2, f4) = (log.clone(), f1.clone(), f2.clone(), f4.clone());
            move || {
                record(&log, "combine");
                let a = f1.read_to_string()?;
                let b = f2.read_to_string()?;
                Ok(f4.write(format!("{a}\n{b}"))?)
            }
        });

        // Registered out of order on purpose, the graph decides.
        dispatcher.register("combine", combine).unwrap();
        dispatcher.register("double-f2", double("double-f2", &f1, &f2)).unwrap();
        dispatcher.register("double-f3", double("double-f3", &f1, &f3)).unwrap();
        dispatcher.register("write-text", write_text).unwrap();

        Self {
            dispatcher,
            log,
            f1,
            f2,
            f3,
            f4,
        }
    }

    fn dispatch(&self) -> Result<workdispatch::Report, DispatchError> {
        self.dispatcher.dispatch(&[&self.f2, &self.f3, &self.f4])
    }
}

#[test]
fn test_topological_example() {
    let (_temp, work) = work();
    let pipeline = Pipeline::new(&work, "hello, world");

    let report = pipeline.dispatch().unwrap();

    // Ties go to the earliest registered action once its inputs are ready.
    assert_eq!(
        executed(&pipeline.log),
        ["write-text", "double-f2", "combine", "double-f3"]
    );
    assert_eq!(report.executed(), ["write-text", "double-f2", "combine", "double-f3"]);
    assert_eq!(
        pipeline.f4.read_to_string().unwrap(),
        "hello, world\nhello, world\nhello, world"
    );
    assert_eq!(pipeline.f3.read_to_string().unwrap(), "hello, world\nhello, world");
}

#[test]
fn test_repeated_dispatch_is_noop() {
    let (_temp, work) = work();
    let pipeline = Pipeline::new(&work, "hello, world");
    pipeline.dispatch().unwrap();

    let report = pipeline.dispatch().unwrap();
    assert!(report.is_noop());
    assert_eq!(report.up_to_date().len(), 4);
    assert_eq!(executed(&pipeline.log).len(), 4);

    // A fresh dispatcher over the same directory sees the same state.
    let fresh = Pipeline::new(&work, "hello, world");
    assert!(fresh.dispatch().unwrap().is_noop());
    assert!(executed(&fresh.log).is_empty());
}

#[test]
fn test_changed_value_propagates() {
    let (_temp, work) = work();
    Pipeline::new(&work, "hello, world").dispatch().unwrap();

    let changed = Pipeline::new(&work, "bye");
    changed.dispatch().unwrap();

    assert_eq!(executed(&changed.log).len(), 4);
    assert_eq!(changed.f4.read_to_string().unwrap(), "bye\nbye\nbye");
}

#[test]
fn test_deleted_output_reruns_its_producer() {
    let (_temp, work) = work();
    Pipeline::new(&work, "hello, world").dispatch().unwrap();

    let pipeline = Pipeline::new(&work, "hello, world");
    fs::remove_file(pipeline.f2.path().unwrap()).unwrap();

    let report = pipeline.dispatch().unwrap();

    // The restored bytes are identical, so `combine` stays up to date.
    assert_eq!(executed(&pipeline.log), ["double-f2"]);
    assert_eq!(report.state("combine"), ActionState::UpToDate);
    assert!(pipeline.f2.exists());
}

#[test]
fn test_tampered_output_is_restored() {
    let (_temp, work) = work();
    Pipeline::new(&work, "hello, world").dispatch().unwrap();

    let pipeline = Pipeline::new(&work, "hello, world");
    pipeline.f1.write("tampered").unwrap();

    pipeline.dispatch().unwrap();

    assert_eq!(executed(&pipeline.log), ["write-text"]);
    assert_eq!(pipeline.f1.read_to_string().unwrap(), "hello, world");
}

#[test]
fn test_only_required_actions_run() {
    let (_temp, work) = work();
    let pipeline = Pipeline::new(&work, "hello, world");

    let report = pipeline.dispatcher.dispatch(&[&pipeline.f3]).unwrap();

    assert_eq!(executed(&pipeline.log), ["write-text", "double-f3"]);
    assert_eq!(report.state("combine"), ActionState::NotRun);
    assert!(!pipeline.f4.exists());
}

#[test]
fn test_progress_listener() {
    let (_temp, work) = work();
    let pipeline = Pipeline::new(&work, "hello, world");

    let mut seen = Vec::new();
    pipeline
        .dispatcher
        .dispatch_with(&[&pipeline.f4], |name| seen.push(name.to_string()))
        .unwrap();

    assert_eq!(seen, ["write-text", "double-f2", "combine"]);
}

#[test]
fn test_cycle_is_rejected_before_running() {
    let (_temp, work) = work();
    let mut dispatcher = Dispatcher::new(&work);
    let log = Log::default();

    let seed = dispatcher.output_file("seed");
    let a = dispatcher.output_file("a");
    let b = dispatcher.output_file("b");

    let logged = |name: &'static str| {
        let log = log.clone();
        move || -> anyhow::Result<()> {
            record(&log, name);
            Ok(())
        }
    };

    dispatcher
        .register("seed", from_fn(&[], &[&seed], logged("seed")))
        .unwrap();
    dispatcher
        .register("ping", from_fn(&[&seed, &b], &[&a], logged("ping")))
        .unwrap();
    dispatcher
        .register("pong", from_fn(&[&a], &[&b], logged("pong")))
        .unwrap();

    let err = dispatcher.dispatch(&[&b]).unwrap_err();

    match err {
        DispatchError::CyclicDependency(names) => assert_eq!(names, ["ping", "pong"]),
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(executed(&log).is_empty());
}

#[test]
fn test_no_producer() {
    let (_temp, work) = work();
    let mut dispatcher = Dispatcher::new(&work);

    let orphan = dispatcher.output_file("orphan.txt");
    let out = dispatcher.output_file("out.txt");
    dispatcher
        .register("consumer", from_fn(&[&orphan], &[&out], || Ok(())))
        .unwrap();

    let err = dispatcher.dispatch(&[&out]).unwrap_err();
    assert!(matches!(err, DispatchError::NoProducer(_)), "{err}");
    assert!(!work.join("consumer").exists());
}

#[test]
fn test_zero_input_action_is_not_rerun() {
    let (_temp, work) = work();

    for expected in [1, 0, 0] {
        let mut dispatcher = Dispatcher::new(&work);
        let runs = Rc::new(Cell::new(0));

        let out = dispatcher.output_file("stamp.txt");
        dispatcher
            .register("stamp", from_fn(&[], &[&out], {
                let (runs, out) = (runs.clone(), out.clone());
                move || {
                    runs.set(runs.get() + 1);
                    Ok(out.write("stamp")?)
                }
            }))
            .unwrap();

        dispatcher.dispatch(&[&out]).unwrap();
        assert_eq!(runs.get(), expected);
    }
}

#[test]
fn test_failure_keeps_completed_fingerprints() {
    let (_temp, work) = work();
    let fail = Rc::new(Cell::new(true));

    let build = |log: &Log| {
        let mut dispatcher = Dispatcher::new(&work);
        let first = dispatcher.output_file("first.txt");
        let second = dispatcher.output_file("second.txt");

        dispatcher
            .register("first", from_fn(&[], &[&first], {
                let (log, first) = (log.clone(), first.clone());
                move || {
                    record(&log, "first");
                    Ok(first.write("1")?)
                }
            }))
            .unwrap();

        dispatcher
            .register("second", from_fn(&[&first], &[&second], {
                let (log, fail, second) = (log.clone(), fail.clone(), second.clone());
                move || {
                    record(&log, "second");
                    if fail.get() {
                        anyhow::bail!("not today");
                    }
                    Ok(second.write("2")?)
                }
            }))
            .unwrap();

        (dispatcher, second)
    };

    let log = Log::default();
    let (dispatcher, second) = build(&log);
    let err = dispatcher.dispatch(&[&second]).unwrap_err();

    assert_eq!(err.action(), Some("second"));
    assert!(matches!(err, DispatchError::ActionFailed(_, ActionError::Execute(_))));
    assert!(err.to_string().contains("not today"));

    fail.set(false);
    let log = Log::default();
    let (dispatcher, second) = build(&log);
    let report = dispatcher.dispatch(&[&second]).unwrap();

    assert_eq!(executed(&log), ["second"]);
    assert_eq!(report.state("first"), ActionState::UpToDate);
    assert_eq!(second.read_to_string().unwrap(), "2");
}

#[test]
fn test_panic_is_reported() {
    let (_temp, work) = work();
    let mut dispatcher = Dispatcher::new(&work);

    let out = dispatcher.output_file("out.txt");
    dispatcher
        .register("explode", from_fn(&[], &[&out], || panic!("boom")))
        .unwrap();

    let err = dispatcher.dispatch(&[&out]).unwrap_err();
    match err {
        DispatchError::ActionFailed(name, ActionError::Panic(msg)) => {
            assert_eq!(name, "explode");
            assert_eq!(msg, "boom");
        }
        other => panic!("expected a panic failure, got {other}"),
    }
}

#[test]
fn test_unwritten_output_fails() {
    let (_temp, work) = work();

    for _ in 0..2 {
        let mut dispatcher = Dispatcher::new(&work);
        let out = dispatcher.output_file("out.txt");
        let stray = work.join("lazy").join("elsewhere.txt");

        dispatcher
            .register("lazy", from_fn(&[], &[&out], move || {
                fs::write(&stray, "wrong place")?;
                Ok(())
            }))
            .unwrap();

        // No fingerprint is written, so the second round fails the same way.
        let err = dispatcher.dispatch(&[&out]).unwrap_err();
        assert!(
            matches!(err, DispatchError::ActionFailed(_, ActionError::MissingOutput(_))),
            "{err}"
        );
    }
}

#[test]
fn test_corrupt_fingerprint_reruns() {
    let (_temp, work) = work();
    Pipeline::new(&work, "hello, world").dispatch().unwrap();

    fs::write(work.join("double-f3").join(".fingerprint.json"), "{ broken").unwrap();

    let pipeline = Pipeline::new(&work, "hello, world");
    pipeline.dispatch().unwrap();
    assert_eq!(executed(&pipeline.log), ["double-f3"]);

    let again = Pipeline::new(&work, "hello, world");
    assert!(again.dispatch().unwrap().is_noop());
}

#[test]
fn test_salt_change_reruns_everything() {
    let (_temp, work) = work();

    let v1 = Pipeline::with(Dispatcher::config(&work).salt("v1").finish(), "hi");
    v1.dispatch().unwrap();

    let same = Pipeline::with(Dispatcher::config(&work).salt("v1").finish(), "hi");
    assert!(same.dispatch().unwrap().is_noop());

    let v2 = Pipeline::with(Dispatcher::config(&work).salt("v2").finish(), "hi");
    v2.dispatch().unwrap();
    assert_eq!(executed(&v2.log).len(), 4);
}

#[test]
fn test_registration_errors() {
    let (_temp, work) = work();
    let mut dispatcher = Dispatcher::new(&work);

    let source = dispatcher.provided_file(work.join("source.txt"));
    let out = dispatcher.output_file("out.txt");

    dispatcher
        .register("producer", from_fn(&[], &[&out], || Ok(())))
        .unwrap();

    let err = dispatcher
        .register("producer", from_fn(&[], &[], || Ok(())))
        .unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateActionName(name) if name == "producer"));

    let err = dispatcher
        .register("thief", from_fn(&[], &[&out], || Ok(())))
        .unwrap_err();
    assert!(
        matches!(&err, DispatchError::MultipleProducers { owner, .. } if owner == "producer"),
        "{err}"
    );

    let err = dispatcher
        .register("overwriter", from_fn(&[], &[&source], || Ok(())))
        .unwrap_err();
    assert!(matches!(err, DispatchError::ProvidedAsOutput(_, action) if action == "overwriter"));

    // The failed names are still free.
    dispatcher
        .register("thief", from_fn(&[&out], &[], || Ok(())))
        .unwrap();
}

#[test]
fn test_output_names_stay_in_the_action_dir() {
    let (temp, work) = work();
    let outside = Utf8PathBuf::from_path_buf(temp.path().join("outside.txt")).unwrap();

    for name in [outside.as_str(), "../escape.txt", "sub/../../escape.txt", ".fingerprint.json"] {
        let mut dispatcher = Dispatcher::new(&work);
        let out = dispatcher.output_file(name);

        let err = dispatcher
            .register("writer", from_fn(&[], &[&out], {
                let out = out.clone();
                move || Ok(out.write("payload")?)
            }))
            .unwrap_err();

        assert!(matches!(&err, DispatchError::InvalidOutputName { .. }), "{name}: {err}");

        // Nothing was registered, the name is still free.
        dispatcher
            .register("writer", from_fn(&[], &[], || Ok(())))
            .unwrap();
    }

    assert!(!outside.exists());
    assert!(!work.exists());
}

#[test]
fn test_handles_from_another_dispatcher() {
    let (_temp, work) = work();
    let mut a = Dispatcher::new(work.join("a"));
    let mut b = Dispatcher::new(work.join("b"));

    let a_out = a.output_file("x.txt");
    let b_value = b.provided("from b".to_string());
    let b_out = b.output_file("x.txt");

    assert_ne!(b_value.erase(), a_out.erase());
    assert_ne!(b_out.erase(), a_out.erase());

    a.register("producer", from_fn(&[], &[&a_out], || Ok(())))
        .unwrap();

    let err = a.dispatch(&[&b_out]).unwrap_err();
    assert!(matches!(err, DispatchError::NoProducer(_)), "{err}");
}

#[test]
fn test_hash_error_fails_the_action() {
    let (temp, work) = work();
    let not_a_file = Utf8PathBuf::from_path_buf(temp.path().join("tree")).unwrap();
    fs::create_dir_all(&not_a_file).unwrap();

    let mut dispatcher = Dispatcher::new(&work);
    let input = dispatcher.provided_file(not_a_file);
    let out = dispatcher.output_file("copy.txt");
    let ran = Rc::new(Cell::new(false));

    dispatcher
        .register("copy", from_fn(&[&input], &[&out], {
            let ran = ran.clone();
            move || {
                ran.set(true);
                Ok(())
            }
        }))
        .unwrap();

    let err = dispatcher.dispatch(&[&out]).unwrap_err();
    match err {
        DispatchError::ActionFailed(name, ActionError::Hash { handle, .. }) => {
            assert_eq!(name, "copy");
            assert!(handle.ends_with("/tree"), "{handle}");
        }
        other => panic!("expected a hashing failure, got {other}"),
    }
    assert!(!ran.get());
}

#[test]
fn test_provided_file_change_reruns() {
    let (temp, work) = work();
    let source = Utf8PathBuf::from_path_buf(temp.path().join("source.txt")).unwrap();
    fs::write(&source, "one").unwrap();

    let run = || {
        let mut dispatcher = Dispatcher::new(&work);
        let input = dispatcher.provided_file(source.clone());
        let out = dispatcher.output_file("copy.txt");

        dispatcher
            .register("copy", from_fn(&[&input], &[&out], {
                let (input, out) = (input.clone(), out.clone());
                move || Ok(out.write(input.read()?)?)
            }))
            .unwrap();

        let report = dispatcher.dispatch(&[&out]).unwrap();
        (report.executed().len(), out.read_to_string().unwrap())
    };

    assert_eq!(run(), (1, "one".to_string()));
    assert_eq!(run(), (0, "one".to_string()));

    fs::write(&source, "two").unwrap();
    assert_eq!(run(), (1, "two".to_string()));
}

#[test]
fn test_glob_and_directory_handles() {
    let (temp, work) = work();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("patches")).unwrap();
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("0001.patch"), "a").unwrap();

    let run = || {
        let mut dispatcher = Dispatcher::new(&work);
        let patches = dispatcher.provided_glob(format!("{root}/*.patch"));
        let out = dispatcher.output_dir("applied");

        dispatcher
            .register("apply", from_fn(&[&patches], &[&out], {
                let (patches, out) = (patches.clone(), out.clone());
                move || {
                    let dir = out.create_clean()?;
                    for patch in patches.files()? {
                        let name = patch.file_name().unwrap_or("patch");
                        fs::copy(&patch, dir.join(name))?;
                    }
                    Ok(())
                }
            }))
            .unwrap();

        let report = dispatcher.dispatch(&[&out]).unwrap();
        let mut names: Vec<String> = fs::read_dir(out.path().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        (report.executed().len(), names)
    };

    assert_eq!(run(), (1, vec!["0001.patch".to_string()]));
    assert_eq!(run().0, 0);

    fs::write(root.join("0002.patch"), "b").unwrap();
    assert_eq!(run(), (1, vec!["0001.patch".to_string(), "0002.patch".to_string()]));
}

#[test]
fn test_lock_contention() {
    let (_temp, work) = work();
    let mut dispatcher = Dispatcher::config(&work).locking(true).finish();

    let out = dispatcher.output_file("out.txt");
    dispatcher
        .register("write", from_fn(&[], &[&out], {
            let out = out.clone();
            move || Ok(out.write("x")?)
        }))
        .unwrap();

    let held = WorkLock::acquire(&work).unwrap();
    let err = dispatcher.dispatch(&[&out]).unwrap_err();
    assert!(matches!(err, DispatchError::Lock(LockError::Contention { .. })), "{err}");
    assert!(!out.exists());

    drop(held);
    dispatcher.dispatch(&[&out]).unwrap();
    assert!(out.exists());
    assert!(!workdispatch::lock::is_locked(&work));
}

#[test]
fn test_leftover_lock_file_doesnt_block() {
    let (_temp, work) = work();
    fs::create_dir_all(&work).unwrap();
    fs::write(
        work.join(".lock"),
        r#"{"pid":999999,"started_at":0,"work":"/gone"}"#,
    )
    .unwrap();

    assert!(!workdispatch::lock::is_locked(&work));

    let pipeline = Pipeline::with(Dispatcher::config(&work).locking(true).finish(), "hi");
    pipeline.dispatch().unwrap();
    assert_eq!(executed(&pipeline.log).len(), 4);

    let report = pipeline.dispatcher.clean_expired(Duration::ZERO).unwrap();
    assert!(report.is_some());
}

#[test]
fn test_clean_expired() {
    let (_temp, work) = work();

    let mut dispatcher = Dispatcher::new(&work);
    let old = dispatcher.output_file("old.txt");
    dispatcher
        .register("old", from_fn(&[], &[&old], {
            let old = old.clone();
            move || Ok(old.write("old")?)
        }))
        .unwrap();
    dispatcher.dispatch(&[&old]).unwrap();

    // Pretend the last use was a day ago.
    let sidecar = work.join("old").join(".fingerprint.json");
    let mut json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
    json["last_used"] = serde_json::json!(0);
    fs::write(&sidecar, json.to_string()).unwrap();

    let pipeline = Pipeline::new(&work, "hello, world");
    pipeline.dispatch().unwrap();

    let report = pipeline
        .dispatcher
        .clean_expired(Duration::from_secs(3600))
        .unwrap()
        .unwrap();

    assert_eq!(report.deleted, vec![work.join("old")]);
    assert!(!work.join("old").exists());
    assert!(pipeline.f4.exists());
}

#[test]
fn test_terminal_hash_skips_the_graph() {
    let (_temp, work) = work();
    let with_hash = |text: &str, hash: &str| {
        let mut dispatcher = Dispatcher::new(&work);
        dispatcher.override_terminal_input_hash(Hash32::hash(hash));
        Pipeline::with(dispatcher, text)
    };

    let first = with_hash("hello, world", "bundle-1");
    first.dispatch().unwrap();
    assert_eq!(executed(&first.log).len(), 4);

    // The hash vouches for everything behind the targets, inputs aren't read.
    let trusted = with_hash("ignored", "bundle-1");
    let mut seen = Vec::new();
    let report = trusted
        .dispatcher
        .dispatch_with(&[&trusted.f2, &trusted.f3, &trusted.f4], |name| {
            seen.push(name.to_string())
        })
        .unwrap();

    assert!(executed(&trusted.log).is_empty());
    assert_eq!(report.up_to_date(), ["double-f2", "combine", "double-f3"]);
    assert_eq!(report.state("write-text"), ActionState::NotRun);
    assert_eq!(seen, report.up_to_date());

    // Skipped dependencies survive cleanup while their consumers are in use.
    let sidecar = work.join("write-text").join(".fingerprint.json");
    let mut json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
    json["last_used"] = serde_json::json!(0);
    fs::write(&sidecar, json.to_string()).unwrap();

    let cleaned = workdispatch::cache::clean_expired(&work, Duration::from_secs(3600), &HashSet::new())
        .unwrap()
        .unwrap();
    assert!(cleaned.deleted.is_empty(), "{:?}", cleaned.deleted);

    // A missing target output falls back to the full walk.
    fs::remove_file(first.f3.path().unwrap()).unwrap();
    let repaired = with_hash("hello, world", "bundle-1");
    repaired.dispatch().unwrap();
    assert_eq!(executed(&repaired.log), ["double-f3"]);

    let bumped = with_hash("bye", "bundle-2");
    bumped.dispatch().unwrap();
    assert_eq!(executed(&bumped.log).len(), 4);
    assert_eq!(bumped.f4.read_to_string().unwrap(), "bye\nbye\nbye");
}

#[test]
fn test_status_reports_stale_without_running() {
    let (_temp, work) = work();

    let pipeline = Pipeline::new(&work, "hello, world");
    let targets: [&dyn Handle; 3] = [&pipeline.f2, &pipeline.f3, &pipeline.f4];
    assert_eq!(pipeline.dispatcher.status(&targets).unwrap().stale().len(), 4);
    assert!(executed(&pipeline.log).is_empty());
    pipeline.dispatch().unwrap();

    let changed = Pipeline::new(&work, "hello, world");
    fs::remove_file(changed.f2.path().unwrap()).unwrap();

    let report = changed
        .dispatcher
        .status(&[&changed.f2, &changed.f3, &changed.f4])
        .unwrap();

    // `combine` reads f2, which is about to be rewritten.
    assert_eq!(report.stale(), ["double-f2", "combine"]);
    assert_eq!(report.up_to_date(), ["write-text", "double-f3"]);
    assert!(executed(&changed.log).is_empty());
    assert!(!changed.f2.exists());

    let mermaid = report.render_mermaid(&changed.dispatcher);
    assert!(mermaid.contains("class n1 stale"), "{mermaid}");
    assert!(mermaid.contains("class n2 uptodate"), "{mermaid}");
}

#[test]
fn test_report_rendering() {
    let (_temp, work) = work();
    let pipeline = Pipeline::new(&work, "hello, world");
    let report = pipeline.dispatcher.dispatch(&[&pipeline.f3]).unwrap();

    let text = report.to_string();
    assert!(text.starts_with("Executed 2 of 2 actions, 0 up to date"), "{text}");

    let mermaid = report.render_mermaid(&pipeline.dispatcher);
    assert!(mermaid.starts_with("graph LR\n"));
    assert!(mermaid.contains("class n3 executed"), "{mermaid}");
    assert!(mermaid.contains("class n0 notrun"), "{mermaid}");
}

#[cfg(unix)]
#[test]
fn test_command_action() {
    let (temp, work) = work();
    let source = Utf8PathBuf::from_path_buf(temp.path().join("in.txt")).unwrap();
    fs::write(&source, "ab").unwrap();

    let run = || {
        let mut dispatcher = Dispatcher::new(&work);
        let input = dispatcher.provided_file(source.clone());
        let out = dispatcher.output_file("twice.txt");

        let command = workdispatch::Command::new("sh")
            .arg("-c")
            .arg("cat \"$0\" \"$0\" > \"$1\"")
            .input_path(&input)
            .output_path(&out);

        dispatcher.register("twice", command).unwrap();
        let report = dispatcher.dispatch(&[&out]).unwrap();
        (report.executed().len(), out.read_to_string().unwrap())
    };

    assert_eq!(run(), (1, "abab".to_string()));
    assert_eq!(run(), (0, "abab".to_string()));
}
