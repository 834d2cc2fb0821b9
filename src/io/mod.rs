use memmap2::{Advice, Mmap};
use std::io::{BufWriter, Write};

const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub fn new_bufwriter<T: Write>(item: T) -> BufWriter<T> {
    BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, item)
}

/// Maps a staged file read-only. The file must not be modified while mapped.
pub fn new_mmap(file: &std::fs::File, sequential: bool) -> anyhow::Result<Mmap> {
    let reader = unsafe { memmap2::MmapOptions::new().map(file) }?;
    #[cfg(unix)]
    {
        if sequential {
            reader.advise(Advice::Sequential)?;
        } else {
            reader.advise(Advice::Random)?;
        }
        reader.advise(Advice::WillNeed)?;
    }

    Ok(reader)
}
