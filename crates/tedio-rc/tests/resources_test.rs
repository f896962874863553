use std::cell::{Cell, RefCell};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc as StdRc;

use tedio_rc::{
    AsyncDispose, BoxError, Dispose, Rc, Resource, Runtime, Scheduler, Scope, scope, yield_now,
};

struct LogFile {
    file: Option<File>,
    closes: StdRc<Cell<usize>>,
}

impl LogFile {
    fn create(path: &Path, closes: StdRc<Cell<usize>>) -> io::Result<Self> {
        Ok(LogFile {
            file: Some(File::create(path)?),
            closes,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("file is closed"))?;
        writeln!(file, "{line}")
    }
}

impl Resource for LogFile {
    type Error = io::Error;
}

impl Dispose for LogFile {
    fn dispose(&mut self) -> io::Result<()> {
        self.closes.set(self.closes.get() + 1);
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("flush failed: {0}")]
struct FlushError(String);

/// Released once a writer acknowledges the flush.
struct Flusher {
    ack: Option<tokio::sync::oneshot::Receiver<Result<(), String>>>,
}

impl Resource for Flusher {
    type Error = FlushError;
}

impl AsyncDispose for Flusher {
    async fn dispose_async(&mut self) -> Result<(), FlushError> {
        let ack = self
            .ack
            .take()
            .ok_or_else(|| FlushError("already flushed".to_string()))?;
        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(FlushError(reason)),
            Err(_) => Err(FlushError("writer gone".to_string())),
        }
    }
}

async fn open_log(path: &Path, scheduler: &Scheduler, closes: StdRc<Cell<usize>>) -> Rc<LogFile> {
    scope(async |s: &Scope| {
        let fd = s.using(Rc::new(LogFile::create(path, closes)?, scheduler));
        fd.borrow_mut().write_line("Hello World")?;
        Ok::<_, BoxError>(fd.keep())
    })
    .await
    .unwrap()
}

#[test]
fn test_file_returned_from_scope_is_closed_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.txt");
    let closes = StdRc::new(Cell::new(0));

    let runtime = Runtime::new();
    let scheduler = runtime.scheduler();

    runtime
        .block_on(scope(async |s: &Scope| {
            let fd = s.using(open_log(&path, scheduler, closes.clone()).await.share());
            fd.borrow_mut().write_line("Hello again")?;
            Ok::<_, BoxError>(())
        }))
        .unwrap();
    assert_eq!(closes.get(), 0);

    runtime.block_on(scheduler.next_tick());
    assert_eq!(closes.get(), 1);
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "Hello World\nHello again\n"
    );
}

#[test]
fn test_file_passed_to_helpers_stays_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.txt");
    let closes = StdRc::new(Cell::new(0));
    let scheduler = Scheduler::new();

    fn append(fd: &Rc<LogFile>, line: &str) -> io::Result<()> {
        let copy = fd.share().guard();
        copy.borrow_mut().write_line(line)
    }

    let fd = Rc::new(LogFile::create(&path, closes.clone()).unwrap(), &scheduler).guard();
    append(&fd, "one").unwrap();
    append(&fd, "two").unwrap();
    assert_eq!(closes.get(), 0);
    fd.borrow_mut().write_line("three").unwrap();

    fd.dispose().unwrap();
    assert_eq!(closes.get(), 1);
    assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\nthree\n");
}

#[test]
fn test_async_release_forwards_outcome() {
    let runtime = Runtime::new();
    let scheduler = runtime.scheduler();
    let (sender, receiver) = tokio::sync::oneshot::channel();

    let flusher = Rc::new_async(
        Flusher {
            ack: Some(receiver),
        },
        scheduler,
    );
    let copy = flusher.share();

    runtime.block_on(async {
        copy.dispose_async().await.unwrap();
        assert!(flusher.borrow().ack.is_some());

        scheduler.spawn_local(async move {
            yield_now().await;
            let _ = sender.send(Err("disk full".to_string()));
            Ok(())
        });

        let error = flusher.dispose_async().await.unwrap_err();
        assert_eq!(error.to_string(), "flush failed: disk full");
    });
    assert!(flusher.is_released());
}

#[test]
fn test_kept_async_resource_released_in_background() {
    let reports = StdRc::new(RefCell::new(Vec::new()));
    let sink = reports.clone();
    let runtime = Runtime::builder()
        .reporter(move |error| sink.borrow_mut().push(error.to_string()))
        .build();
    let scheduler = runtime.scheduler();
    let (sender, receiver) = tokio::sync::oneshot::channel();

    let flusher = Rc::new_async(
        Flusher {
            ack: Some(receiver),
        },
        scheduler,
    );
    let kept = flusher.keep();
    runtime.block_on(flusher.dispose_async()).unwrap();
    assert_eq!(kept.count(), 1);

    // The deferred release waits for the writer in the background.
    runtime.block_on(scheduler.next_tick());
    assert!(kept.is_released());
    assert!(kept.try_borrow().is_err());

    sender.send(Err("writer crashed".to_string())).unwrap();
    runtime.block_on(async {
        yield_now().await;
    });
    assert_eq!(*reports.borrow(), vec!["error during async disposal".to_string()]);
    assert!(kept.try_borrow().unwrap().ack.is_none());
}
