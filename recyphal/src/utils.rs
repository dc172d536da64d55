use recyphal_core::Priority;

pub(crate) mod function;
pub(crate) mod multiset;

pub(crate) use function::InlineFunction;
pub(crate) use multiset::Multiset;

/// Array with one element per priority level, indexable by [`Priority`].
#[derive(Default)]
pub(crate) struct PriorityArray<T>([T; Priority::LEVELS]);

impl<T> core::ops::Index<Priority> for PriorityArray<T> {
    type Output = T;

    fn index(&self, index: Priority) -> &Self::Output {
        &self.0[usize::from(index)]
    }
}

impl<T> core::ops::IndexMut<Priority> for PriorityArray<T> {
    fn index_mut(&mut self, index: Priority) -> &mut Self::Output {
        &mut self.0[usize::from(index)]
    }
}
