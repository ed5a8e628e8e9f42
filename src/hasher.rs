use std::hash::Hasher as _;
use std::io::{self, Read};
use twox_hash::XxHash64;

const READ_CHUNK: usize = 64 * 1024;

/// Stream a reader through XxHash64 without holding the content in memory.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut hasher = XxHash64::with_seed(0);
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.write(&buffer[..read]);
    }
    Ok(hasher.finish())
}

pub fn hash_data(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// The catalog stores checksums in a signed column.
pub fn as_checksum(hash: u64) -> i64 {
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_and_slice_agree() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let streamed = hash_reader(&data[..]).unwrap();
        assert_eq!(streamed, hash_data(data));
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_hash() {
        let data = vec![7u8; READ_CHUNK * 2 + 13];
        assert_eq!(hash_reader(&data[..]).unwrap(), hash_data(&data));
    }
}
