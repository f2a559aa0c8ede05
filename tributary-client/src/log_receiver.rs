use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tributary_core::{ChannelPosition, InterceptorChain, MessageConsumer, StopCondition};

use crate::{
    errors::{ReceiverError, Result},
    log_source::{LogSource, PartitionPage},
    partition_consumer::PartitionConsumer,
    receiver_options::ReceiverOptions,
    retry_manager::RetryManager,
};

/// LogReceiver consumes all open partitions of a channel in parallel and merges the positions
/// reached into one resumable [`ChannelPosition`].
pub struct LogReceiver {
    // the log the channel lives in
    source: Arc<dyn LogSource>,
    // the channel name, from where the messages are consumed
    channel: String,
    // configurable options for retries, polling and shutdown
    options: ReceiverOptions,
    // applied to every message before it reaches the consumer
    interceptors: Arc<InterceptorChain>,
    // stop flag shared with every partition task
    stopping: Arc<AtomicBool>,
}

impl LogReceiver {
    pub fn new(source: Arc<dyn LogSource>, channel: impl Into<String>, options: ReceiverOptions) -> Self {
        LogReceiver {
            source,
            channel: channel.into(),
            options,
            interceptors: Arc::new(InterceptorChain::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an interceptor chain with other receivers or event sources.
    pub fn with_interceptors(mut self, interceptors: Arc<InterceptorChain>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn interceptors(&self) -> &Arc<InterceptorChain> {
        &self.interceptors
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    /// Lists the partitions of the channel that still accept records. Closed partitions are
    /// skipped with a warning.
    pub async fn open_partitions(&self) -> Result<Vec<String>> {
        let retry_manager = self.options.retry_manager();
        let mut partitions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .list_page(&retry_manager, page_token.as_deref())
                .await?;
            for partition in page.partitions {
                if partition.is_open {
                    partitions.push(partition.partition_id);
                } else {
                    warn!(
                        target: "log_receiver",
                        channel = %self.channel,
                        partition = %partition.partition_id,
                        "partition is closed, excluding it from consumption"
                    );
                }
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(partitions)
    }

    async fn list_page(
        &self,
        retry_manager: &RetryManager,
        page_token: Option<&str>,
    ) -> Result<PartitionPage> {
        let mut attempts = 0;
        loop {
            match self.source.list_partitions(&self.channel, page_token).await {
                Ok(page) => return Ok(page),
                Err(error) if retry_manager.is_retryable_error(&error) => {
                    attempts += 1;
                    if attempts > retry_manager.max_retries() {
                        return Err(ReceiverError::RetriesExhausted {
                            partition_id: String::new(),
                            attempts,
                            source: error,
                        });
                    }
                    let backoff = retry_manager.calculate_backoff(attempts - 1);
                    warn!(
                        target: "log_receiver",
                        channel = %self.channel,
                        attempt = attempts,
                        error = %error,
                        "unable to list partitions, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Consumes every open partition from its slice of `start_from` until the stop condition
    /// holds for each of them, or until [`stop`](Self::stop) is called.
    ///
    /// The first failing partition cancels its siblings; they get `shutdown_grace` to return
    /// before they are aborted, and the failure is returned.
    pub async fn consume(
        &self,
        start_from: ChannelPosition,
        stop_condition: StopCondition,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Result<ChannelPosition> {
        let started = Instant::now();
        let partitions = self.open_partitions().await?;

        if self.is_stopping() {
            info!(
                target: "log_receiver",
                channel = %self.channel,
                "receiver is stopping, nothing consumed"
            );
            return Ok(start_from);
        }

        info!(
            target: "log_receiver",
            channel = %self.channel,
            partitions = partitions.len(),
            start = %start_from,
            "channel consumption started"
        );

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for partition_id in partitions {
            let partition_consumer = PartitionConsumer::new(
                Arc::clone(&self.source),
                self.channel.clone(),
                partition_id.clone(),
                self.options.clone(),
                Arc::clone(&self.interceptors),
                Arc::clone(&self.stopping),
                cancel.clone(),
            );
            let start = start_from.shard(&partition_id);
            let stop_condition = stop_condition.clone();
            let consumer = Arc::clone(&consumer);
            tasks.spawn(async move {
                partition_consumer
                    .consume(start, &stop_condition, consumer.as_ref())
                    .await
            });
        }

        let mut reached = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(position)) => {
                    reached.push(position);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_error) => ReceiverError::TaskFailed(join_error.to_string()),
            };

            error!(
                target: "log_receiver",
                channel = %self.channel,
                error = %failure,
                "partition consumption failed, cancelling remaining partitions"
            );
            cancel.cancel();
            let grace = self.options.shutdown_grace();
            let drained = tokio::time::timeout(grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    target: "log_receiver",
                    channel = %self.channel,
                    grace_ms = grace.as_millis() as u64,
                    "partitions did not stop in time, aborting"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
            return Err(failure);
        }

        let reached: ChannelPosition = reached.into_iter().collect();
        let position = start_from.merge(&reached);
        info!(
            target: "log_receiver",
            channel = %self.channel,
            elapsed_ms = started.elapsed().as_millis() as u64,
            position = %position,
            "channel consumption finished"
        );
        Ok(position)
    }

    /// Requests all partition consumers to stop before their next record. Idempotent.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            info!(target: "log_receiver", channel = %self.channel, "stop requested");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
