//! Usage walkthrough: open, put, get, delete, then the same with a write
//! batch.

use bitkeg::{Engine, Options, WriteBatchOptions};
use tracing_subscriber::EnvFilter;

fn main() -> bitkeg::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = std::env::temp_dir().join("bitkeg-example");
    let options = Options {
        dir_path: dir,
        ..Options::default()
    };
    let engine = Engine::open(options)?;

    engine.put("hello", "world")?;
    let value = engine.get(b"hello")?;
    println!("key: hello  value: {}", String::from_utf8_lossy(&value));

    engine.delete(b"hello")?;

    let batch = engine.new_write_batch(WriteBatchOptions::default());
    batch.put("user:1", "alice")?;
    batch.put("user:2", "bob")?;
    batch.commit()?;

    for key in engine.list_keys()? {
        let value = engine.get(&key)?;
        println!("key: {}  value: {}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
    }

    engine.close()?;
    Ok(())
}
