use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use strand::{co_thread, install, Coro, Resumer, Signal, TaskError, Tasklet};

struct EventLoop {
    runq: Mutex<VecDeque<Coro>>,
    waker: Condvar,
}

impl EventLoop {
    fn new() -> Arc<EventLoop> {
        Arc::new(EventLoop { runq: Mutex::new(VecDeque::new()), waker: Condvar::new() })
    }

    fn run_until_complete<V: 'static>(&self, task: &mut Tasklet<V>) -> Result<V, TaskError> {
        if !task.started() {
            task.start();
        }
        while task.running() {
            let mut runq = self.runq.lock().unwrap();
            while runq.is_empty() {
                runq = self.waker.wait(runq).unwrap();
            }
            let batch: Vec<Coro> = runq.drain(..).collect();
            drop(runq);
            for coro in batch {
                coro.resume();
            }
        }
        task.get()
    }
}

impl Resumer for EventLoop {
    fn resume(&self, coro: Coro) {
        let mut runq = self.runq.lock().unwrap();
        runq.push_back(coro);
        self.waker.notify_one();
    }
}

fn main() {
    let event_loop = EventLoop::new();
    let _guard = install(event_loop.clone());

    let updates = Signal::<String>::new();
    let _printer = updates.connect_owned(|line: &String| eprintln!("update: {}", line));

    let mut relay = {
        let updates = updates.clone();
        Tasklet::new(async move {
            let fetched = co_thread(|| {
                thread::sleep(Duration::from_millis(200));
                "payload from worker".to_owned()
            });
            let payload = fetched.await.expect("worker panicked");
            updates.emit(payload.clone());
            payload.len()
        })
    };
    relay.set_name("relay");

    let size = event_loop.run_until_complete(&mut relay).expect("relay failed");
    eprintln!("relayed {} bytes", size);
}
