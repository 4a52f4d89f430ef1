use bytemuck::Pod;

/// Reusable per-query scratch storage. Traversal stacks borrow typed views
/// of one word buffer, so a steady ray stream stops allocating once the
/// buffer has grown to the largest stack any query needed. One `Scratch`
/// serves one thread; concurrent queries each carry their own.
#[derive(Default)]
pub struct Scratch {
    words: Vec<u64>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(8)],
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * 8
    }

    fn words_for<T>(count: usize) -> usize {
        (count * std::mem::size_of::<T>()).div_ceil(8)
    }
}

/// A zeroed `[T]` view over a `Scratch`, released when it goes out of
/// scope. `T` must be plain data no more than 8-byte aligned.
pub struct ScratchArray<'s, T: Pod> {
    slice: &'s mut [T],
}

impl<'s, T: Pod> ScratchArray<'s, T> {
    pub fn new(scratch: &'s mut Scratch, count: usize) -> Self {
        debug_assert!(std::mem::align_of::<T>() <= 8);

        let words = Scratch::words_for::<T>(count);
        if scratch.words.len() < words {
            scratch.words.resize(words, 0);
        }

        let bytes = bytemuck::cast_slice_mut::<u64, u8>(&mut scratch.words[..words]);
        let bytes = &mut bytes[..count * std::mem::size_of::<T>()];
        bytes.fill(0);
        let slice = bytemuck::cast_slice_mut::<u8, T>(bytes);

        Self { slice }
    }
}

impl<T: Pod> std::ops::Deref for ScratchArray<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.slice
    }
}

impl<T: Pod> std::ops::DerefMut for ScratchArray<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.slice
    }
}
