use std::borrow::Borrow;
use std::cmp::{max, Ordering};
use std::fmt;

type Link<K, V> = Option<Box<AvlNode<K, V>>>;

struct AvlNode<K, V> {
    key: K,
    value: V,
    height: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V> AvlNode<K, V> {
    fn leaf(key: K, value: V) -> Self {
        Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        }
    }

    fn update_height(&mut self) {
        self.height = 1 + max(height(&self.left), height(&self.right));
    }

    fn balance_factor(&self) -> isize {
        height(&self.left) as isize - height(&self.right) as isize
    }
}

fn height<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.height)
}

fn rotate_right<K, V>(mut y: Box<AvlNode<K, V>>) -> Box<AvlNode<K, V>> {
    match y.left.take() {
        Some(mut x) => {
            y.left = x.right.take();
            y.update_height();
            x.right = Some(y);
            x.update_height();
            x
        }
        None => y,
    }
}

fn rotate_left<K, V>(mut x: Box<AvlNode<K, V>>) -> Box<AvlNode<K, V>> {
    match x.right.take() {
        Some(mut y) => {
            x.right = y.left.take();
            x.update_height();
            y.left = Some(x);
            y.update_height();
            y
        }
        None => x,
    }
}

/// Restores the height and balance of the subtree rooted at `link`, assuming
/// both children are already balanced.
fn rebalance<K, V>(link: &mut Link<K, V>) {
    let mut node = match link.take() {
        Some(node) => node,
        None => return,
    };
    node.update_height();
    let balance = node.balance_factor();
    if balance > 1 {
        if node.left.as_ref().map_or(0, |l| l.balance_factor()) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        node = rotate_right(node);
    } else if balance < -1 {
        if node.right.as_ref().map_or(0, |r| r.balance_factor()) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        node = rotate_left(node);
    }
    *link = Some(node);
}

fn insert_at<K: Ord, V>(link: &mut Link<K, V>, key: K, value: V) -> bool {
    let inserted = match link {
        None => {
            *link = Some(Box::new(AvlNode::leaf(key, value)));
            return true;
        }
        Some(node) => match key.cmp(&node.key) {
            Ordering::Less => insert_at(&mut node.left, key, value),
            Ordering::Greater => insert_at(&mut node.right, key, value),
            Ordering::Equal => false,
        },
    };
    if inserted {
        rebalance(link);
    }
    inserted
}

/// Detaches the smallest node of a subtree, rebalancing on the way back up.
fn take_min<K, V>(link: &mut Link<K, V>) -> Link<K, V> {
    if link.as_ref()?.left.is_some() {
        let min = take_min(&mut link.as_mut()?.left);
        rebalance(link);
        min
    } else {
        let mut node = link.take()?;
        *link = node.right.take();
        Some(node)
    }
}

fn remove_at<K, V, Q>(link: &mut Link<K, V>, key: &Q) -> Option<V>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    let removed = match key.cmp(link.as_ref()?.key.borrow()) {
        Ordering::Less => remove_at(&mut link.as_mut()?.left, key),
        Ordering::Greater => remove_at(&mut link.as_mut()?.right, key),
        Ordering::Equal => {
            let mut node = link.take()?;
            *link = match (node.left.take(), node.right.take()) {
                (None, None) => None,
                (Some(child), None) | (None, Some(child)) => Some(child),
                (Some(left), Some(right)) => {
                    let mut right = Some(right);
                    match take_min(&mut right) {
                        Some(mut successor) => {
                            successor.left = Some(left);
                            successor.right = right;
                            Some(successor)
                        }
                        None => Some(left),
                    }
                }
            };
            Some(node.value)
        }
    };
    if removed.is_some() {
        rebalance(link);
    }
    removed
}

/// A height-balanced binary search tree. After every insertion and removal the
/// heights of any node's two subtrees differ by at most one.
pub struct AvlTree<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K: Ord, V> Default for AvlTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> AvlTree<K, V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn height(&self) -> usize {
        height(&self.root)
    }

    /// Inserts a new entry. Returns false, leaving the tree unchanged, if the
    /// key is already present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let inserted = insert_at(&mut self.root, key, value);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if self.root.is_none() {
            return None;
        }
        let removed = remove_at(&mut self.root, key);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            match key.cmp(node.key.borrow()) {
                Ordering::Less => cur = node.left.as_deref(),
                Ordering::Greater => cur = node.right.as_deref(),
                Ordering::Equal => return Some(&node.value),
            }
        }
        None
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut cur = self.root.as_deref_mut();
        while let Some(node) = cur {
            match key.cmp(node.key.borrow()) {
                Ordering::Less => cur = node.left.as_deref_mut(),
                Ordering::Greater => cur = node.right.as_deref_mut(),
                Ordering::Equal => return Some(&mut node.value),
            }
        }
        None
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// In-order traversal.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// Mutable in-order traversal over the values.
    pub fn for_each_mut<F: FnMut(&K, &mut V)>(&mut self, mut f: F) {
        fn walk<K, V, F: FnMut(&K, &mut V)>(link: &mut Link<K, V>, f: &mut F) {
            if let Some(node) = link {
                walk(&mut node.left, f);
                f(&node.key, &mut node.value);
                walk(&mut node.right, f);
            }
        }
        walk(&mut self.root, &mut f);
    }

    /// Checks the height bookkeeping and the balance condition at every node.
    pub fn is_balanced(&self) -> bool {
        fn checked_height<K, V>(link: &Link<K, V>) -> Option<usize> {
            match link {
                None => Some(0),
                Some(node) => {
                    let l = checked_height(&node.left)?;
                    let r = checked_height(&node.right)?;
                    let h = 1 + max(l, r);
                    if l.abs_diff(r) > 1 || node.height != h {
                        None
                    } else {
                        Some(h)
                    }
                }
            }
        }
        checked_height(&self.root).is_some()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for AvlTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        let mut stack = Vec::new();
        let mut cur = self.root.as_deref();
        loop {
            while let Some(node) = cur {
                stack.push(node);
                cur = node.left.as_deref();
            }
            match stack.pop() {
                Some(node) => {
                    map.entry(&node.key, &node.value);
                    cur = node.right.as_deref();
                }
                None => break,
            }
        }
        map.finish()
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<&'a AvlNode<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left(&mut self, mut node: Option<&'a AvlNode<K, V>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}
