/*!
 * Singly-linked chunked list
 *
 * Fixed-capacity parts appended as the tail fills. Element storage never
 * reallocates, so addresses handed out by `push` stay valid for the life
 * of the list — which is the point: the open-files registry needs stable
 * entries while the rest of the cycle mutates around it.
 */

pub struct ChunkedList<T> {
    parts: Vec<Vec<T>>,
    part_capacity: usize,
    len: usize,
}

impl<T> ChunkedList<T> {
    pub fn new(part_capacity: usize) -> Self {
        let part_capacity = part_capacity.max(1);
        Self {
            parts: vec![Vec::with_capacity(part_capacity)],
            part_capacity,
            len: 0,
        }
    }

    /// Append a value, adding a new part when the tail part is full, and
    /// return its slot
    pub fn push(&mut self, value: T) -> &mut T {
        if self.parts.last().map(|p| p.len() == self.part_capacity) == Some(true) {
            self.parts.push(Vec::with_capacity(self.part_capacity));
        }
        let tail = self.parts.last_mut().expect("list has at least one part");
        tail.push(value);
        self.len += 1;
        tail.last_mut().expect("value was just pushed")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    /// Iterate part by part, elements in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.parts.iter().flat_map(|p| p.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.parts.iter_mut().flat_map(|p| p.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_iterate_in_order() {
        let mut list: ChunkedList<u32> = ChunkedList::new(3);
        for i in 0..10 {
            list.push(i);
        }
        assert_eq!(list.len(), 10);
        assert_eq!(list.parts(), 4); // 3 + 3 + 3 + 1
        let collected: Vec<u32> = list.iter().copied().collect();
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_addresses_are_stable() {
        let mut list: ChunkedList<u64> = ChunkedList::new(2);
        let first = list.push(42) as *const u64;
        // Fill several more parts; the first element must not move
        for i in 0..20 {
            list.push(i);
        }
        let addr_now = list.iter().next().unwrap() as *const u64;
        assert_eq!(first, addr_now);
        assert_eq!(unsafe { *addr_now }, 42);
    }

    #[test]
    fn test_empty_list() {
        let list: ChunkedList<i32> = ChunkedList::new(4);
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
        assert_eq!(list.parts(), 1);
    }

    #[test]
    fn test_iter_mut() {
        let mut list: ChunkedList<i32> = ChunkedList::new(2);
        for i in 0..5 {
            list.push(i);
        }
        for v in list.iter_mut() {
            *v *= 10;
        }
        let collected: Vec<i32> = list.iter().copied().collect();
        assert_eq!(collected, vec![0, 10, 20, 30, 40]);
    }
}
