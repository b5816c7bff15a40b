// Reads fixed-size headers from a file on dedicated threads.
//
// Run with `RUST_LOG=dedicated_pool=trace` to see worker lifecycle events.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use dedicated_pool::logging::{self, info};
use dedicated_pool::{pool_span, PoolError, Registry, ThreadPool, ThreadPoolConfig};

const HEADER_LEN: usize = 16;

#[derive(Debug)]
enum ReadError {
    Pool(PoolError),
    Io(io::Error),
}

impl From<PoolError> for ReadError {
    fn from(err: PoolError) -> Self {
        ReadError::Pool(err)
    }
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(err)
    }
}

fn read_header(path: PathBuf, index: u64) -> Result<(String, [u8; HEADER_LEN]), ReadError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(index * HEADER_LEN as u64))?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;

    let thread = thread::current().name().unwrap_or("unnamed").to_string();
    Ok((thread, header))
}

fn main() -> Result<(), ReadError> {
    logging::init_development();

    let path = std::env::temp_dir().join("dedicated-pool-demo.index");
    let contents: Vec<u8> = (0..8u8)
        .flat_map(|block| std::iter::repeat(block).take(HEADER_LEN))
        .collect();
    fs::write(&path, contents)?;

    let registry = Registry::new();
    let config = ThreadPoolConfig {
        num_threads: 2,
        ..Default::default()
    };
    let pool = Arc::new(ThreadPool::try_new(config, &registry)?);
    pool.start()?;

    let span = pool_span!("index-header", pool.size());
    let _guard = span.enter();

    let readers: Vec<_> = (0..8u64)
        .map(|index| {
            let pool = Arc::clone(&pool);
            let path = path.clone();
            thread::spawn(move || pool.try_call(move || read_header(path, index)))
        })
        .collect();

    for (index, reader) in readers.into_iter().enumerate() {
        match reader.join() {
            Ok(Ok((thread, header))) => info!(index, thread = %thread, first_byte = header[0], "header read"),
            Ok(Err(err)) => info!(index, error = ?err, "header read failed"),
            Err(_) => info!(index, "reader thread panicked"),
        }
    }

    pool.stop_and_wait();
    print!("{}", registry.gather());

    fs::remove_file(&path)?;
    Ok(())
}
