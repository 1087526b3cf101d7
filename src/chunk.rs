/// Splits `text` into consecutive pieces of at most `max_chunk_size`
/// characters. Joining the pieces gives back `text`; empty text yields no
/// pieces. A size of zero is treated as one.
pub fn split(text: &str, max_chunk_size: usize) -> Vec<String> {
    let size = max_chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
