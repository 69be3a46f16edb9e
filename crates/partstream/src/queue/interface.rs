/// A one-shot unit of deferred work.
///
/// A queue calls exactly one of [`Job::process`] (normal execution on the
/// worker) or [`Job::destroy`] (the queue can no longer execute work, so the
/// job runs in place and is released).
pub trait Job: Send {
    fn process(&mut self);

    fn destroy(mut self: Box<Self>) {
        self.process();
    }
}

/// Executes [`Job`]s off the calling thread.
///
/// `push` must not block for unbounded time: it is called from transport
/// callback threads.
pub trait WorkQueue: Send + Sync {
    fn push(&self, job: Box<dyn Job>);
}
