//! End-to-end scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use psg::{CancelToken, Combine, Combiner, CombinerPool, Emit, Gather, Job, Scope, TaskPool};

#[tokio::test(flavor = "multi_thread")]
async fn hello_pipeline() {
    let job = Job::new(None);
    let pool = TaskPool::new(&job, 2);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let results = Arc::new(Mutex::new(Vec::new()));
    let gather_calls = Arc::new(AtomicUsize::new(0));

    let gather = {
        let results = Arc::clone(&results);
        let gather_calls = Arc::clone(&gather_calls);
        Gather::new(move |_ctx, _scope, result: Result<&'static str, anyhow::Error>| {
            let results = Arc::clone(&results);
            let gather_calls = Arc::clone(&gather_calls);
            async move {
                gather_calls.fetch_add(1, Ordering::SeqCst);
                results.lock().unwrap().push(result.unwrap());
                Ok(())
            }
        })
    };

    gather
        .scatter(&ctx, &scope, &pool, |_ctx, _scope| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok("Hello")
        })
        .await
        .unwrap();
    gather
        .scatter(&ctx, &scope, &pool, |_ctx, _scope| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok("world!")
        })
        .await
        .unwrap();

    job.close_and_gather_all(&ctx, &scope).await.unwrap();

    let mut got = results.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, vec!["Hello", "world!"]);
    assert_eq!(gather_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn recursive_scatter_from_gather() {
    let job = Job::new(None);
    let pool = TaskPool::new(&job, 1);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let self_handle: Arc<std::sync::OnceLock<Gather<i32>>> = Arc::new(std::sync::OnceLock::new());

    let gather: Gather<i32> = {
        let collected = Arc::clone(&collected);
        let pool_for_recurse = Arc::clone(&pool);
        let self_handle = Arc::clone(&self_handle);
        Gather::new(move |ctx, scope, result: Result<i32, anyhow::Error>| {
            let collected = Arc::clone(&collected);
            let pool_for_recurse = Arc::clone(&pool_for_recurse);
            let self_handle = Arc::clone(&self_handle);
            async move {
                let n = result.unwrap();
                collected.lock().unwrap().push(n);
                if n > 0 {
                    let self_gather = self_handle.get().unwrap().clone();
                    self_gather
                        .scatter(&ctx, &scope, &pool_for_recurse, move |_ctx, _scope| async move {
                            Ok(n - 1)
                        })
                        .await?;
                }
                Ok(())
            }
        })
    };
    // The closure above needs a handle to its own `Gather` to recurse; stash
    // it in a shared cell once constructed, read back inside the closure.
    self_handle.set(gather.clone()).ok().unwrap();

    gather
        .scatter(&ctx, &scope, &pool, |_ctx, _scope| async { Ok(3) })
        .await
        .unwrap();

    job.close_and_gather_all(&ctx, &scope).await.unwrap();

    let got = collected.lock().unwrap().clone();
    assert_eq!(got, vec![3, 2, 1, 0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn backpressure_respects_pool_limit() {
    let job = Job::new(None);
    let pool = TaskPool::new(&job, 1);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let concurrent = Arc::new(AtomicU32::new(0));
    let max_concurrent = Arc::new(AtomicU32::new(0));
    let gathered = Arc::new(Mutex::new(Vec::new()));

    let gather = {
        let gathered = Arc::clone(&gathered);
        Gather::new(move |_ctx, _scope, result: Result<usize, anyhow::Error>| {
            let gathered = Arc::clone(&gathered);
            async move {
                gathered.lock().unwrap().push(result.unwrap());
                Ok(())
            }
        })
    };

    let start = tokio::time::Instant::now();
    for i in 0..10usize {
        let concurrent = Arc::clone(&concurrent);
        let max_concurrent = Arc::clone(&max_concurrent);
        gather
            .scatter(&ctx, &scope, &pool, move |_ctx, _scope| async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })
            .await
            .unwrap();
    }
    let elapsed = start.elapsed();

    job.close_and_gather_all(&ctx, &scope).await.unwrap();

    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    let mut got = gathered.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
    // 10 sequential 10ms tasks with a slack allowance for scheduling jitter.
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
}

struct CountingCombiner {
    counts: HashMap<String, i32>,
}

impl Combiner<String, HashMap<String, i32>> for CountingCombiner {
    fn combine(
        &mut self,
        _ctx: &CancelToken,
        _scope: &Scope,
        input: Result<String, anyhow::Error>,
        _emit: &Emit<HashMap<String, i32>>,
    ) {
        let key = input.unwrap();
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn flush(&mut self, ctx: &CancelToken, scope: &Scope, emit: &Emit<HashMap<String, i32>>) {
        emit.emit(ctx.clone(), scope.clone(), Ok(std::mem::take(&mut self.counts)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn combiner_counting() {
    let job = Job::new(None);
    let task_pool = TaskPool::new(&job, -1);
    let combiner_pool = CombinerPool::new(&job);
    // Pin this scenario to a single combiner worker: it only checks that one
    // combiner instance sees every input, not the primary/secondary election
    // machinery (covered separately at the unit level).
    combiner_pool.set_limit(1);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let gather_calls = Arc::new(AtomicUsize::new(0));
    let final_map = Arc::new(Mutex::new(None));

    let gather = {
        let gather_calls = Arc::clone(&gather_calls);
        let final_map = Arc::clone(&final_map);
        Gather::new(move |_ctx, _scope, result: Result<HashMap<String, i32>, anyhow::Error>| {
            let gather_calls = Arc::clone(&gather_calls);
            let final_map = Arc::clone(&final_map);
            async move {
                gather_calls.fetch_add(1, Ordering::SeqCst);
                *final_map.lock().unwrap() = Some(result.unwrap());
                Ok(())
            }
        })
    };

    let combine: Arc<Combine<String, HashMap<String, i32>>> = Combine::new(gather, Arc::clone(&combiner_pool), || {
        Some(Box::new(CountingCombiner { counts: HashMap::new() }) as Box<dyn Combiner<String, HashMap<String, i32>> + Send>)
    });

    for letter in ["A", "A", "B", "C", "A"] {
        combine
            .scatter(&ctx, &scope, &task_pool, move |_ctx, _scope| async move { Ok(letter.to_string()) })
            .await
            .unwrap();
    }

    job.close_and_gather_all(&ctx, &scope).await.unwrap();

    assert_eq!(gather_calls.load(Ordering::SeqCst), 1);
    let map = final_map.lock().unwrap().clone().unwrap();
    assert_eq!(map.get("A"), Some(&3));
    assert_eq!(map.get("B"), Some(&1));
    assert_eq!(map.get("C"), Some(&1));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_flight() {
    let job = Job::new(None);
    let pool = TaskPool::new(&job, 2);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let reports = Arc::new(AtomicUsize::new(0));
    let gather = {
        let reports = Arc::clone(&reports);
        Gather::new(move |_ctx, _scope, _result: Result<(), anyhow::Error>| {
            let reports = Arc::clone(&reports);
            async move {
                reports.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    // Launch all 5 concurrently: with a pool limit of 2, three of these
    // `scatter` calls will be blocked on admission (cooperatively draining
    // the gather channel) when cancellation fires.
    let launches: Vec<_> = (0..5)
        .map(|_| {
            let gather = gather.clone();
            let pool = Arc::clone(&pool);
            let ctx = ctx.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                gather
                    .scatter(&ctx, &scope, &pool, |task_ctx, _scope| async move {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(()),
                            _ = task_ctx.cancelled() => Err(anyhow::anyhow!("canceled")),
                        }
                    })
                    .await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    job.cancel();

    let mut scatter_errs = 0;
    for launch in launches {
        if launch.await.unwrap().is_err() {
            scatter_errs += 1;
        }
    }

    // `close_and_gather_all` must observe the cancellation and return an
    // error, though it may have drained some already-completed gathers
    // first.
    let outcome = job.close_and_gather_all(&ctx, &scope).await;
    assert!(outcome.is_err());

    // Every admitted task worker has, by now, finished (either completing
    // its sleep or observing `task_ctx.cancelled()`) — the waitgroup
    // `cancel_and_wait` joins proves no worker is left running.
    job.cancel_and_wait().await;

    // Mop up anything `close_and_gather_all` left queued once it bailed out
    // on cancellation.
    job.try_gather_all(&ctx, &scope).await.unwrap();

    assert_eq!(reports.load(Ordering::SeqCst) + scatter_errs, 5);
    assert_eq!(job.stage(), psg::Stage::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_pools_pipeline() {
    let job = Job::new(None);
    let pool_io = TaskPool::new(&job, 100);
    let pool_cpu = TaskPool::new(&job, 4);
    let ctx = CancelToken::new();
    let scope = Scope::root();

    let io_concurrent = Arc::new(AtomicU32::new(0));
    let io_max = Arc::new(AtomicU32::new(0));
    let cpu_concurrent = Arc::new(AtomicU32::new(0));
    let cpu_max = Arc::new(AtomicU32::new(0));
    let results: Arc<Mutex<HashMap<usize, i64>>> = Arc::new(Mutex::new(HashMap::new()));

    let hash_gather = {
        let results = Arc::clone(&results);
        Gather::new(move |_ctx, _scope, result: Result<(usize, i64), anyhow::Error>| {
            let results = Arc::clone(&results);
            async move {
                let (idx, hash) = result.unwrap();
                results.lock().unwrap().insert(idx, hash);
                Ok(())
            }
        })
    };

    let read_gather = {
        let pool_cpu = Arc::clone(&pool_cpu);
        let cpu_concurrent = Arc::clone(&cpu_concurrent);
        let cpu_max = Arc::clone(&cpu_max);
        let hash_gather = hash_gather.clone();
        Gather::new(move |ctx, scope, result: Result<(usize, Vec<u8>), anyhow::Error>| {
            let pool_cpu = Arc::clone(&pool_cpu);
            let cpu_concurrent = Arc::clone(&cpu_concurrent);
            let cpu_max = Arc::clone(&cpu_max);
            let hash_gather = hash_gather.clone();
            async move {
                let (idx, bytes) = result.unwrap();
                hash_gather
                    .scatter(&ctx, &scope, &pool_cpu, move |_ctx, _scope| async move {
                        let now = cpu_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        cpu_max.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_micros(200)).await;
                        let hash: i64 = bytes.iter().map(|b| *b as i64).sum();
                        cpu_concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok((idx, hash))
                    })
                    .await
            }
        })
    };

    for idx in 0..50usize {
        let io_concurrent = Arc::clone(&io_concurrent);
        let io_max = Arc::clone(&io_max);
        read_gather
            .scatter(&ctx, &scope, &pool_io, move |_ctx, _scope| async move {
                let now = io_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                io_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_micros(100)).await;
                io_concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok((idx, vec![idx as u8; 4]))
            })
            .await
            .unwrap();
    }

    job.close_and_gather_all(&ctx, &scope).await.unwrap();

    assert_eq!(results.lock().unwrap().len(), 50);
    assert!(io_max.load(Ordering::SeqCst) <= 100);
    assert!(cpu_max.load(Ordering::SeqCst) <= 4);
}
